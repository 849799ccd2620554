use dispatcher::{CancelToken, Dispatcher, Error, InferenceRequest, InferenceResponse};
use std::{sync::Arc, thread};
use tokio::sync::oneshot;

/// Run a dispatch on its own thread so the runtime is never blocked by an
/// executor. If the awaiting future is dropped (client went away) the
/// request is cancelled.
pub(crate) async fn dispatch(
    dispatcher: Arc<Dispatcher>,
    request: InferenceRequest,
) -> Result<InferenceResponse, Error> {
    let guard = CancelOnDrop(Some(request.cancel.clone()));
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        let _ = tx.send(dispatcher.dispatch(request));
    });
    let response = rx
        .await
        .unwrap_or_else(|_| Err(Error::Internal("dispatch worker exited".to_string())));
    guard.disarm();
    response
}

struct CancelOnDrop(Option<CancelToken>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            log::debug!("Request abandoned by client, cancelling");
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel;
    use dispatcher::{
        DispatcherConfig, ExecutionError, Executor, ExecutorRequest, ExecutorResponse,
        OverloadPolicy, Registry,
    };
    use kalypso_contract::{DataType, ModelContract, ShapePattern, Tensor, TensorSpec};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Echoes `x` as `y` once the test releases it.
    struct Gate {
        executed: Arc<AtomicUsize>,
        started: channel::Sender<()>,
        release: channel::Receiver<()>,
    }

    impl Executor for Gate {
        fn execute(
            &self,
            requests: Vec<ExecutorRequest>,
        ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            self.started.send(()).unwrap();
            self.release.recv().unwrap();
            Ok(requests
                .iter()
                .map(|r| {
                    let y = r.input("x").unwrap().clone().renamed("y");
                    ExecutorResponse::from_tensors(vec![y])
                })
                .collect())
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("gate").input(Tensor::from_slice("x", vec![1], &[1f32]).unwrap())
    }

    #[tokio::test]
    async fn test_dropped_future_cancels_queued_request() {
        let spec = |name: &str| {
            TensorSpec::new(name, DataType::Fp32, ShapePattern::from_dims(&[-1]).unwrap())
        };
        let contract = ModelContract::new("gate", 1, vec![spec("x")], vec![spec("y")]).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let (started_tx, started) = channel::unbounded();
        let (release, release_rx) = channel::unbounded();
        let config = DispatcherConfig {
            max_concurrent_requests_per_version: Some(1),
            overload_policy: OverloadPolicy::Queue,
            ..DispatcherConfig::default()
        };
        let registry = Registry::new(&config);
        let gate = Gate {
            executed: executed.clone(),
            started: started_tx,
            release: release_rx,
        };
        registry.register(contract, Box::new(gate)).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(registry, &config));

        let busy = tokio::spawn(dispatch(dispatcher.clone(), request()));
        tokio::task::spawn_blocking(move || started.recv_timeout(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        let cancel = CancelToken::new();
        let queued = dispatch(dispatcher.clone(), request().cancel_token(cancel.clone()));
        // gives up while the request waits for the permit
        let abandoned = tokio::time::timeout(Duration::from_millis(20), queued).await;
        assert!(abandoned.is_err());
        assert!(cancel.is_cancelled());

        // let the queued worker observe the cancel before the permit frees up
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.send(()).unwrap();
        let response = busy.await.unwrap().unwrap();
        assert_eq!(response.outputs["y"].to_vec::<f32>().unwrap(), vec![1.]);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_dispatch_is_not_cancelled() {
        let spec = |name: &str| {
            TensorSpec::new(name, DataType::Fp32, ShapePattern::from_dims(&[-1]).unwrap())
        };
        let contract = ModelContract::new("gate", 1, vec![spec("x")], vec![spec("y")]).unwrap();
        let (started_tx, _started) = channel::unbounded();
        let (release, release_rx) = channel::unbounded();
        release.send(()).unwrap();
        let registry = Registry::default();
        let gate = Gate {
            executed: Arc::new(AtomicUsize::new(0)),
            started: started_tx,
            release: release_rx,
        };
        registry.register(contract, Box::new(gate)).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(registry, &DispatcherConfig::default()));

        let cancel = CancelToken::new();
        let response = dispatch(dispatcher, request().cancel_token(cancel.clone())).await;
        assert!(response.is_ok());
        assert!(!cancel.is_cancelled());
    }
}
