use crate::{
    config::OverloadPolicy,
    executor::{ExecutionError, Executor, ExecutorRequest, ExecutorResponse},
    registry::Inner,
    CancelToken, Error,
};
use crossbeam::channel;
use kalypso_contract::ModelContract;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

// how often a queued request re-checks cancellation
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A loaded model version. Shared by the Registry and every in-flight
/// dispatch; the executor is finalized when the last reference drops.
pub(crate) struct Model {
    contract: Arc<ModelContract>,
    executor: Box<dyn Executor>,
    permits: Option<Permits>,
    registry: Weak<Inner>,
    released: channel::Sender<()>,
}

impl Model {
    /// `executor` must already be initialized. An executor that cannot run
    /// concurrently gets a single permit whatever `max_concurrency` says.
    pub fn new(
        contract: Arc<ModelContract>,
        executor: Box<dyn Executor>,
        max_concurrency: Option<usize>,
        registry: Weak<Inner>,
        released: channel::Sender<()>,
    ) -> Self {
        let limit = if executor.supports_concurrent_execution() {
            max_concurrency.filter(|&n| n > 0)
        } else {
            Some(1)
        };
        Model {
            contract,
            executor,
            permits: limit.map(Permits::new),
            registry,
            released,
        }
    }

    pub fn contract(&self) -> &Arc<ModelContract> {
        &self.contract
    }

    /// Take a concurrency permit, None when the version is unlimited.
    pub fn admit(
        &self,
        policy: OverloadPolicy,
        queue_timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Option<Permit<'_>>, Error> {
        let permits = match &self.permits {
            Some(permits) => permits,
            None => return Ok(None),
        };
        let permit = match policy {
            OverloadPolicy::Reject => permits.try_acquire().ok_or_else(|| {
                Error::Unavailable(format!(
                    "model '{}' version {} is at its limit of {} concurrent requests",
                    self.contract.model_name(),
                    self.contract.version(),
                    permits.limit
                ))
            })?,
            OverloadPolicy::Queue => permits.acquire(queue_timeout, cancel).map_err(|err| {
                match err {
                    Error::Unavailable(_) => Error::Unavailable(format!(
                        "model '{}' version {} queue timeout expired",
                        self.contract.model_name(),
                        self.contract.version()
                    )),
                    other => other,
                }
            })?,
        };
        Ok(Some(permit))
    }

    /// Run the executor. Callers hold a permit from [`Model::admit`]. A panic
    /// is reported as a failure.
    pub fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(requests)))
            .unwrap_or_else(|payload| {
                Err(ExecutionError::Failed(format!(
                    "executor panicked: {}",
                    panic_message(&*payload)
                )))
            })
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        let name = self.contract.model_name().to_string();
        let version = self.contract.version();
        self.executor.finalize();
        log::info!("Model {} version {} finalized", name, version);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_unloaded(&name, version);
        }
        let _ = self.released.send(());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Token pool: a bounded channel pre-filled with `limit` tokens.
pub(crate) struct Permits {
    tx: channel::Sender<()>,
    rx: channel::Receiver<()>,
    limit: usize,
}

/// Returns its token on drop.
pub(crate) struct Permit<'a>(&'a channel::Sender<()>);

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

impl Permits {
    fn new(limit: usize) -> Self {
        let (tx, rx) = channel::bounded(limit);
        for _ in 0..limit {
            let _ = tx.send(());
        }
        Permits { tx, rx, limit }
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        self.rx.try_recv().ok().map(|()| Permit(&self.tx))
    }

    fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Permit<'_>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Unavailable("queue timeout".to_string()));
                    }
                    (deadline - now).min(QUEUE_POLL_INTERVAL)
                }
                None => QUEUE_POLL_INTERVAL,
            };
            match self.rx.recv_timeout(wait) {
                Ok(()) => return Ok(Permit(&self.tx)),
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Internal("permit pool closed".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_permits() {
        let permits = Permits::new(2);
        let a = permits.try_acquire().unwrap();
        let _b = permits.try_acquire().unwrap();
        assert!(permits.try_acquire().is_none());
        drop(a);
        assert!(permits.try_acquire().is_some());
    }

    #[test]
    fn test_queue_timeout_and_cancel() {
        let permits = Permits::new(1);
        let _held = permits.try_acquire().unwrap();
        let cancel = CancelToken::new();
        let started = Instant::now();
        let err = permits
            .acquire(Some(Duration::from_millis(30)), &cancel)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        cancel.cancel();
        let err = permits.acquire(None, &cancel).err().unwrap();
        assert_eq!(err, Error::Cancelled);
    }

    #[test]
    fn test_queue_waits_for_release() {
        let permits = Arc::new(Permits::new(1));
        let (tx, rx) = channel::bounded(1);
        let held = permits.try_acquire().unwrap();
        let waiter = {
            let permits = permits.clone();
            std::thread::spawn(move || {
                let permit = permits.acquire(None, &CancelToken::new());
                tx.send(permit.is_ok()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        waiter.join().unwrap();
    }
}
