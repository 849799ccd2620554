use crossbeam::channel;
use dispatcher::{
    Builder, CancelToken, DispatcherConfig, Error, ExecutionError, Executor, ExecutorRequest,
    ExecutorResponse, InferenceRequest, ModelInfo, OverloadPolicy, Registry,
};
use kalypso_contract::{DataType, ModelContract, ShapePattern, Tensor, TensorSpec};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

#[derive(Default)]
struct Counters {
    executed: AtomicUsize,
    finalized: AtomicUsize,
}

/// Elementwise sum and difference, counting calls. Optionally blocks each
/// call until the test lets it go.
struct StubAddSub {
    counters: Arc<Counters>,
    gate: Option<(channel::Sender<()>, channel::Receiver<()>)>,
}

impl Executor for StubAddSub {
    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.gate {
            started.send(()).unwrap();
            release.recv().unwrap();
        }
        requests
            .into_iter()
            .map(|request| {
                let a = request.input("INPUT0").unwrap();
                let b = request.input("INPUT1").unwrap();
                let x = a.to_vec::<f32>().unwrap();
                let y = b.to_vec::<f32>().unwrap();
                if x.len() != y.len() {
                    return Err(ExecutionError::InvalidArgument(
                        "INPUT0 and INPUT1 differ in size".to_string(),
                    ));
                }
                let sum: Vec<f32> = x.iter().zip(&y).map(|(a, b)| a + b).collect();
                let diff: Vec<f32> = x.iter().zip(&y).map(|(a, b)| a - b).collect();
                Ok(ExecutorResponse::from_tensors(vec![
                    Tensor::from_slice("OUTPUT0", a.shape().to_vec(), &sum).unwrap(),
                    Tensor::from_slice("OUTPUT1", a.shape().to_vec(), &diff).unwrap(),
                ]))
            })
            .collect()
    }

    fn finalize(&mut self) {
        self.counters.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns a wrongly shaped OUTPUT1.
struct Misbehaving;

impl Executor for Misbehaving {
    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        Ok(requests
            .iter()
            .map(|_| {
                ExecutorResponse::from_tensors(vec![
                    Tensor::from_slice("OUTPUT0", vec![1, 4], &[0f32; 4]).unwrap(),
                    Tensor::from_slice("OUTPUT1", vec![1, 3], &[0f32; 3]).unwrap(),
                ])
            })
            .collect())
    }
}

struct Panicking;

impl Executor for Panicking {
    fn execute(
        &self,
        _requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        panic!("kernel exploded")
    }
}

fn add_sub_contract(version: u64) -> ModelContract {
    let spec = |name: &str| {
        TensorSpec::new(
            name,
            DataType::Fp32,
            ShapePattern::from_dims(&[-1, 4]).unwrap(),
        )
    };
    ModelContract::new(
        "add_sub",
        version,
        vec![spec("INPUT0"), spec("INPUT1")],
        vec![spec("OUTPUT0"), spec("OUTPUT1")],
    )
    .unwrap()
}

fn stub(counters: &Arc<Counters>) -> Box<dyn Executor> {
    Box::new(StubAddSub {
        counters: counters.clone(),
        gate: None,
    })
}

fn add_sub_request(x: &[f32], y: &[f32]) -> InferenceRequest {
    let rows = (x.len() / 4) as i64;
    InferenceRequest::new("add_sub")
        .input(Tensor::from_slice("INPUT0", vec![rows, 4], x).unwrap())
        .input(Tensor::from_slice("INPUT1", vec![rows, 4], y).unwrap())
}

fn frontend_with(executor: Box<dyn Executor>) -> dispatcher::Frontend {
    let executor = Mutex::new(Some(executor));
    Builder::new()
        .register_model(ModelInfo::new(add_sub_contract(1), move |_| {
            executor.lock().unwrap().take().unwrap()
        }))
        .build()
}

#[test]
fn test_add_sub_scenario() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let response = frontend
        .dispatcher
        .dispatch(add_sub_request(&[1., 2., 3., 4.], &[4., 3., 2., 1.]).id("42"))
        .unwrap();
    assert_eq!(response.id, "42");
    assert_eq!(response.model_version, 1);
    let out0 = response.output("OUTPUT0").unwrap();
    let out1 = response.output("OUTPUT1").unwrap();
    assert_eq!(out0.to_vec::<f32>().unwrap(), vec![5., 5., 5., 5.]);
    assert_eq!(out1.to_vec::<f32>().unwrap(), vec![-3., -1., 1., 3.]);
    assert_eq!(out0.shape(), &[1, 4]);
    assert_eq!(out1.datatype(), DataType::Fp32);
}

#[test]
fn test_batch_is_forwarded_whole() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let x: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let response = frontend
        .dispatcher
        .dispatch(add_sub_request(&x, &x))
        .unwrap();
    assert_eq!(response.output("OUTPUT0").unwrap().shape(), &[3, 4]);
    assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_requested_outputs_are_filtered() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let response = frontend
        .dispatcher
        .dispatch(add_sub_request(&[1., 2., 3., 4.], &[4., 3., 2., 1.]).request_output("OUTPUT1"))
        .unwrap();
    assert_eq!(response.outputs.len(), 1);
    assert!(response.output("OUTPUT1").is_some());
}

#[test]
fn test_missing_input_never_executes() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let request = InferenceRequest::new("add_sub")
        .input(Tensor::from_slice("INPUT0", vec![1, 4], &[1f32; 4]).unwrap());
    let err = frontend.dispatcher.dispatch(request).unwrap_err();
    match err {
        Error::InvalidArgument(msg) => assert!(msg.contains("INPUT1"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shape_mismatch_is_invalid_argument() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let request = InferenceRequest::new("add_sub")
        .input(Tensor::from_slice("INPUT0", vec![3], &[1f32; 3]).unwrap())
        .input(Tensor::from_slice("INPUT1", vec![1, 4], &[1f32; 4]).unwrap());
    let err = frontend.dispatcher.dispatch(request).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidArgument("input 'INPUT0': shape mismatch, expected [-1,4] got [3]".to_string())
    );
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_datatype_mismatch_is_invalid_argument() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let request = InferenceRequest::new("add_sub")
        .input(Tensor::from_slice("INPUT0", vec![1, 4], &[1i32; 4]).unwrap())
        .input(Tensor::from_slice("INPUT1", vec![1, 4], &[1f32; 4]).unwrap());
    let err = frontend.dispatcher.dispatch(request).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidArgument(
            "input 'INPUT0': datatype mismatch, expected FP32 got INT32".to_string()
        )
    );
}

#[test]
fn test_unknown_model_and_version() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let mut request = add_sub_request(&[0.; 4], &[0.; 4]);
    request.model_name = "nope".to_string();
    assert_eq!(
        frontend.dispatcher.dispatch(request).unwrap_err(),
        Error::NotFound("nope".to_string())
    );
    assert!(frontend.registry.is_ready("add_sub"));
    assert_eq!(frontend.registry.index().len(), 1);

    let request = add_sub_request(&[0.; 4], &[0.; 4]).version(7);
    assert_eq!(
        frontend.dispatcher.dispatch(request).unwrap_err(),
        Error::VersionNotFound {
            model: "add_sub".to_string(),
            version: 7
        }
    );
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_repeated_requests_are_stable() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let first = frontend
        .dispatcher
        .dispatch(add_sub_request(&[1., 2., 3., 4.], &[0.; 4]))
        .unwrap();
    for _ in 0..5 {
        let next = frontend
            .dispatcher
            .dispatch(add_sub_request(&[1., 2., 3., 4.], &[0.; 4]))
            .unwrap();
        for (name, tensor) in &first.outputs {
            let other = next.output(name).unwrap();
            assert_eq!(tensor.shape(), other.shape());
            assert_eq!(tensor.datatype(), other.datatype());
        }
    }
}

#[test]
fn test_executor_contract_violation_is_internal() {
    let frontend = frontend_with(Box::new(Misbehaving));
    let err = frontend
        .dispatcher
        .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
        .unwrap_err();
    assert_eq!(
        err,
        Error::Internal(
            "model 'add_sub' output 'OUTPUT1': shape mismatch, expected [-1,4] got [1, 3]"
                .to_string()
        )
    );
}

#[test]
fn test_executor_invalid_argument_passes_through() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let request = InferenceRequest::new("add_sub")
        .input(Tensor::from_slice("INPUT0", vec![2, 4], &[1f32; 8]).unwrap())
        .input(Tensor::from_slice("INPUT1", vec![1, 4], &[1f32; 4]).unwrap());
    assert_eq!(
        frontend.dispatcher.dispatch(request).unwrap_err(),
        Error::InvalidArgument("INPUT0 and INPUT1 differ in size".to_string())
    );
}

#[test]
fn test_executor_panic_is_internal() {
    let frontend = frontend_with(Box::new(Panicking));
    let err = frontend
        .dispatcher
        .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
        .unwrap_err();
    assert!(
        matches!(&err, Error::Internal(msg) if msg.contains("kernel exploded")),
        "{:?}",
        err
    );
    // still serving afterwards
    assert!(frontend.registry.is_ready("add_sub"));
}

#[test]
fn test_cancelled_before_execution() {
    let counters = Arc::new(Counters::default());
    let frontend = frontend_with(stub(&counters));
    let cancel = CancelToken::new();
    cancel.cancel();
    let request = add_sub_request(&[0.; 4], &[0.; 4]).cancel_token(cancel);
    assert_eq!(
        frontend.dispatcher.dispatch(request).unwrap_err(),
        Error::Cancelled
    );
    assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
}

fn gated_stub(counters: &Arc<Counters>) -> (StubAddSub, channel::Receiver<()>, channel::Sender<()>) {
    let (started_tx, started_rx) = channel::unbounded();
    let (release_tx, release_rx) = channel::unbounded();
    let executor = StubAddSub {
        counters: counters.clone(),
        gate: Some((started_tx, release_rx)),
    };
    (executor, started_rx, release_tx)
}

fn gated(counters: &Arc<Counters>) -> (Box<dyn Executor>, channel::Receiver<()>, channel::Sender<()>) {
    let (executor, started, release) = gated_stub(counters);
    (Box::new(executor), started, release)
}

/// A StubAddSub that must not run concurrently.
struct SerialOnly(StubAddSub);

impl Executor for SerialOnly {
    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        self.0.execute(requests)
    }

    fn supports_concurrent_execution(&self) -> bool {
        false
    }
}

fn gated_serial(counters: &Arc<Counters>) -> (Box<dyn Executor>, channel::Receiver<()>, channel::Sender<()>) {
    let (executor, started, release) = gated_stub(counters);
    (Box::new(SerialOnly(executor)), started, release)
}

fn dispatcher_with(executor: Box<dyn Executor>, config: &DispatcherConfig) -> Arc<dispatcher::Dispatcher> {
    let registry = Registry::new(config);
    registry.register(add_sub_contract(1), executor).unwrap();
    Arc::new(dispatcher::Dispatcher::new(registry, config))
}

fn occupy(dispatcher: &Arc<dispatcher::Dispatcher>) -> thread::JoinHandle<Result<dispatcher::InferenceResponse, Error>> {
    let dispatcher = dispatcher.clone();
    thread::spawn(move || dispatcher.dispatch(add_sub_request(&[0.; 4], &[0.; 4])))
}

/// Queue a second request behind a busy executor, cancel it while it waits
/// and check it never reaches the executor. Without a concurrency limit the
/// executor is serial-only.
fn assert_queued_request_cancels(config: DispatcherConfig) {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = match config.max_concurrent_requests_per_version {
        Some(_) => gated(&counters),
        None => gated_serial(&counters),
    };
    let dispatcher = dispatcher_with(executor, &config);
    let busy = occupy(&dispatcher);
    started.recv_timeout(Duration::from_secs(1)).unwrap();

    let cancel = CancelToken::new();
    let queued = {
        let dispatcher = dispatcher.clone();
        let request = add_sub_request(&[0.; 4], &[0.; 4]).cancel_token(cancel.clone());
        thread::spawn(move || dispatcher.dispatch(request))
    };
    thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    assert_eq!(queued.join().unwrap().unwrap_err(), Error::Cancelled);
    assert_eq!(counters.executed.load(Ordering::SeqCst), 1);

    release.send(()).unwrap();
    assert!(busy.join().unwrap().is_ok());
    assert!(started.try_recv().is_err());
    assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrency_limit_rejects() {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated(&counters);
    let config = DispatcherConfig {
        max_concurrent_requests_per_version: Some(1),
        ..DispatcherConfig::default()
    };
    let registry = Registry::new(&config);
    registry.register(add_sub_contract(1), executor).unwrap();
    let dispatcher = Arc::new(dispatcher::Dispatcher::new(registry, &config));

    let busy = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.dispatch(add_sub_request(&[0.; 4], &[0.; 4])))
    };
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    let err = dispatcher
        .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "{:?}", err);
    release.send(()).unwrap();
    assert!(busy.join().unwrap().is_ok());
    // the permit came back
    release.send(()).unwrap();
    assert!(dispatcher.dispatch(add_sub_request(&[0.; 4], &[0.; 4])).is_ok());
}

#[test]
fn test_concurrency_limit_queues() {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated(&counters);
    let config = DispatcherConfig {
        max_concurrent_requests_per_version: Some(1),
        overload_policy: OverloadPolicy::Queue,
        ..DispatcherConfig::default()
    };
    let registry = Registry::new(&config);
    registry.register(add_sub_contract(1), executor).unwrap();
    let dispatcher = Arc::new(dispatcher::Dispatcher::new(registry, &config));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.dispatch(add_sub_request(&[0.; 4], &[0.; 4])))
        })
        .collect();
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    // second request is queued, not running
    assert!(started.recv_timeout(Duration::from_millis(50)).is_err());
    release.send(()).unwrap();
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    release.send(()).unwrap();
    for worker in workers {
        assert!(worker.join().unwrap().is_ok());
    }
    assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unload_drains_in_flight_requests() {
    const N: usize = 4;
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated(&counters);
    let registry = Registry::default();
    registry.register(add_sub_contract(1), executor).unwrap();
    let dispatcher = Arc::new(dispatcher::Dispatcher::new(
        registry.clone(),
        &DispatcherConfig::default(),
    ));

    let workers: Vec<_> = (0..N)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let x = [i as f32; 4];
                dispatcher.dispatch(add_sub_request(&x, &x))
            })
        })
        .collect();
    for _ in 0..N {
        started.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    let ticket = registry.unload("add_sub", 1).unwrap();
    // no new admissions
    assert_eq!(
        dispatcher
            .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
            .unwrap_err(),
        Error::NotReady {
            model: "add_sub".to_string(),
            version: 1
        }
    );
    assert!(!ticket.wait_timeout(Duration::from_millis(20)));
    assert_eq!(counters.finalized.load(Ordering::SeqCst), 0);

    for _ in 0..N - 1 {
        release.send(()).unwrap();
    }
    assert!(!ticket.wait_timeout(Duration::from_millis(20)));
    assert_eq!(counters.finalized.load(Ordering::SeqCst), 0);
    release.send(()).unwrap();

    for (i, worker) in workers.into_iter().enumerate() {
        let response = worker.join().unwrap().unwrap();
        let sum = response.output("OUTPUT0").unwrap().to_vec::<f32>().unwrap();
        assert_eq!(sum, vec![2. * i as f32; 4]);
    }
    ticket.wait();
    assert_eq!(counters.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(counters.executed.load(Ordering::SeqCst), N);
    assert_eq!(
        dispatcher
            .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
            .unwrap_err(),
        Error::NotFound("add_sub".to_string())
    );
}

#[test]
fn test_unload_does_not_block_other_models() {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated(&counters);
    let registry = Registry::default();
    registry.register(add_sub_contract(1), executor).unwrap();
    registry.register(add_sub_contract(2), stub(&counters)).unwrap();
    let dispatcher = Arc::new(dispatcher::Dispatcher::new(
        registry.clone(),
        &DispatcherConfig::default(),
    ));
    let slow = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.dispatch(add_sub_request(&[0.; 4], &[0.; 4]).version(1)))
    };
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    let ticket = registry.unload("add_sub", 1).unwrap();
    // version 2 keeps serving while version 1 drains
    let response = dispatcher
        .dispatch(add_sub_request(&[1.; 4], &[1.; 4]))
        .unwrap();
    assert_eq!(response.model_version, 2);
    release.send(()).unwrap();
    assert!(slow.join().unwrap().is_ok());
    ticket.wait();
}

#[test]
fn test_serial_executor_rejects_when_busy() {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated_serial(&counters);
    let dispatcher = dispatcher_with(executor, &DispatcherConfig::default());

    let busy = occupy(&dispatcher);
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    let err = dispatcher
        .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "{:?}", err);
    assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
    release.send(()).unwrap();
    assert!(busy.join().unwrap().is_ok());
}

#[test]
fn test_serial_executor_honors_queue_timeout() {
    let counters = Arc::new(Counters::default());
    let (executor, started, release) = gated_serial(&counters);
    let config = DispatcherConfig {
        overload_policy: OverloadPolicy::Queue,
        queue_timeout: Some(Duration::from_millis(30)),
        ..DispatcherConfig::default()
    };
    let dispatcher = dispatcher_with(executor, &config);

    let busy = occupy(&dispatcher);
    started.recv_timeout(Duration::from_secs(1)).unwrap();
    let err = dispatcher
        .dispatch(add_sub_request(&[0.; 4], &[0.; 4]))
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "{:?}", err);
    release.send(()).unwrap();
    assert!(busy.join().unwrap().is_ok());
    assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_serial_executor_queued_request_cancels() {
    let config = DispatcherConfig {
        overload_policy: OverloadPolicy::Queue,
        ..DispatcherConfig::default()
    };
    assert_queued_request_cancels(config);
}

#[test]
fn test_queued_request_cancels() {
    let config = DispatcherConfig {
        max_concurrent_requests_per_version: Some(1),
        overload_policy: OverloadPolicy::Queue,
        ..DispatcherConfig::default()
    };
    assert_queued_request_cancels(config);
}
