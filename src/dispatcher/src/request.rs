//! Inference requests and responses as the Dispatcher sees them.
use crate::Error;
use kalypso_contract::Tensor;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Shared flag a caller sets to abort a request.
/// Observed by the Dispatcher up to the moment the executor is invoked;
/// after that it is up to the executor.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Request is built by the front end and owned by the Dispatcher while it runs.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    /// Optional client id, echoed in the response.
    pub id: String,
    /// Target model
    pub model_name: String,
    /// Target version, None for the configured default.
    pub version: Option<u64>,
    /// Inputs by name
    pub inputs: HashMap<String, Tensor>,
    /// Outputs to return, empty for all declared outputs.
    pub requested_outputs: HashSet<String>,
    /// Cancellation flag
    pub cancel: CancelToken,
}

impl InferenceRequest {
    /// Create a request for `model_name` with no inputs.
    pub fn new(model_name: impl Into<String>) -> Self {
        InferenceRequest {
            model_name: model_name.into(),
            ..InferenceRequest::default()
        }
    }

    /// Set the client id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Pin a version.
    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Add an input, keyed by its tensor name. A later input with the same name wins.
    pub fn input(mut self, tensor: Tensor) -> Self {
        self.inputs.insert(tensor.name().to_string(), tensor);
        self
    }

    /// Add inputs, rejecting two tensors with the same name.
    pub fn with_inputs(mut self, tensors: Vec<Tensor>) -> Result<Self, Error> {
        for tensor in tensors {
            if self.inputs.contains_key(tensor.name()) {
                return Err(Error::InvalidArgument(format!(
                    "input '{}' given more than once",
                    tensor.name()
                )));
            }
            self.inputs.insert(tensor.name().to_string(), tensor);
        }
        Ok(self)
    }

    /// Ask for one output.
    pub fn request_output(mut self, name: impl Into<String>) -> Self {
        self.requested_outputs.insert(name.into());
        self
    }

    /// Attach a cancellation token.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Successful result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    /// Echo of the request id
    pub id: String,
    /// Model that served the request
    pub model_name: String,
    /// Version that served the request
    pub model_version: u64,
    /// Outputs by name
    pub outputs: HashMap<String, Tensor>,
}

impl InferenceResponse {
    /// Get an output by name.
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }
}
