//! The executor seam. Concrete model backends implement [`Executor`] and
//! are chosen by configuration.

use crate::CancelToken;
use kalypso_contract::{ModelContract, Tensor};
use std::collections::{HashMap, HashSet};

/// One request inside an executor batch. Inputs are already validated.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    /// Inputs by name
    pub inputs: HashMap<String, Tensor>,
    /// Outputs the caller wants, empty for all. Executors may ignore it.
    pub requested_outputs: HashSet<String>,
    /// Set when the caller gave up. Honoring it is optional.
    pub cancel: CancelToken,
}

impl ExecutorRequest {
    /// Get an input by name.
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name)
    }
}

/// Outputs for one request of a batch.
#[derive(Debug, Clone, Default)]
pub struct ExecutorResponse {
    /// Outputs by name
    pub outputs: HashMap<String, Tensor>,
}

impl ExecutorResponse {
    /// Build a response keyed by tensor names.
    pub fn from_tensors(tensors: Vec<Tensor>) -> Self {
        let outputs = tensors
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        ExecutorResponse { outputs }
    }
}

/// Executor refused to start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("executor initialization failed: {0}")]
pub struct InitError(pub String);

/// Executor failed a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The inputs are well formed but the computation rejects them,
    /// e.g. numeric overflow on a cast. Reported to the client as such.
    #[error("{0}")]
    InvalidArgument(String),
    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

/// All model backends managed by the Registry have the Executor trait.
/// An executor is initialized once before serving and finalized once after
/// the last in-flight request that holds it has completed.
///
/// Executors that cannot run `execute` concurrently return false from
/// [`Executor::supports_concurrent_execution`]; such a version admits one
/// request at a time under the configured overload policy. Cancellation
/// during `execute` is best-effort and only happens if the executor polls
/// [`ExecutorRequest::cancel`].
pub trait Executor: Send + Sync {
    /// Prepare for serving `contract`.
    fn initialize(&mut self, _contract: &ModelContract) -> Result<(), InitError> {
        Ok(())
    }

    /// Run a batch, returning exactly one response per request, in order.
    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError>;

    /// Release resources.
    fn finalize(&mut self) {}

    /// Whether `execute` may be called from several threads at once.
    fn supports_concurrent_execution(&self) -> bool {
        true
    }
}
