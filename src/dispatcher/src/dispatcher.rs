//! Dispatcher
use crate::{
    config::{DispatcherConfig, OverloadPolicy},
    executor::{ExecutionError, ExecutorRequest},
    observability,
    registry::Registry,
    Error, InferenceRequest, InferenceResponse,
};
use kalypso_contract::{ModelContract, Tensor};
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

/// Dispatcher is the single place where requests are checked against a
/// model contract. It is shared by every protocol front end and may be
/// called from any number of threads.
pub struct Dispatcher {
    registry: Registry,
    overload_policy: OverloadPolicy,
    queue_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Create a Dispatcher over `registry`.
    pub fn new(registry: Registry, config: &DispatcherConfig) -> Self {
        Dispatcher {
            registry,
            overload_policy: config.overload_policy,
            queue_timeout: config.queue_timeout,
        }
    }

    /// The registry requests are resolved against.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve, validate, run and check one request. Lookup and validation
    /// failures return before any executor is touched. Every outcome is
    /// recorded in the inference metrics.
    pub fn dispatch(&self, request: InferenceRequest) -> Result<InferenceResponse, Error> {
        let started = Instant::now();
        let model_name = request.model_name.clone();
        let mut version = request.version;
        let result = self.run(request, &mut version);
        observability::record_inference(&model_name, version, &result, started.elapsed());
        result
    }

    /// `resolved` is updated once lookup has picked a version.
    fn run(
        &self,
        request: InferenceRequest,
        resolved: &mut Option<u64>,
    ) -> Result<InferenceResponse, Error> {
        let InferenceRequest {
            id,
            model_name,
            version,
            inputs,
            requested_outputs,
            cancel,
        } = request;
        let (contract, handle) = self.registry.lookup(&model_name, version)?;
        *resolved = Some(contract.version());
        validate_inputs(&contract, &inputs)?;
        validate_requested_outputs(&contract, &requested_outputs)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let model = handle.model();
        let _permit = model
            .admit(self.overload_policy, self.queue_timeout, &cancel)
            .map_err(|err| {
                log::debug!("Request to {} rejected: {}", model_name, err);
                err
            })?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = ExecutorRequest {
            inputs,
            requested_outputs: requested_outputs.clone(),
            cancel,
        };
        let mut responses = model.execute(vec![request]).map_err(|err| {
            log::warn!(
                "Model {} version {} failed: {}",
                model_name,
                contract.version(),
                err
            );
            match err {
                ExecutionError::InvalidArgument(msg) => Error::InvalidArgument(msg),
                ExecutionError::Failed(msg) => Error::Internal(format!(
                    "model '{}' version {}: {}",
                    model_name,
                    contract.version(),
                    msg
                )),
            }
        })?;
        if responses.len() != 1 {
            return Err(Error::Internal(format!(
                "model '{}' returned {} responses for 1 request",
                model_name,
                responses.len()
            )));
        }
        let outputs = match responses.pop() {
            Some(response) => check_outputs(&contract, response.outputs, &requested_outputs)?,
            None => return Err(Error::Internal("no response".to_string())),
        };
        Ok(InferenceResponse {
            id,
            model_name,
            model_version: contract.version(),
            outputs,
        })
    }
}

fn validate_inputs(contract: &ModelContract, inputs: &HashMap<String, Tensor>) -> Result<(), Error> {
    for spec in contract.inputs() {
        let tensor = inputs.get(spec.name()).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "missing required input '{}' for model '{}'",
                spec.name(),
                contract.model_name()
            ))
        })?;
        spec.check(tensor).map_err(|mismatch| {
            Error::InvalidArgument(format!("input '{}': {}", spec.name(), mismatch))
        })?;
        let max_batch_size = contract.max_batch_size();
        if max_batch_size > 0 {
            if let Some(&batch) = tensor.shape().first() {
                if batch > i64::from(max_batch_size) {
                    return Err(Error::InvalidArgument(format!(
                        "input '{}': batch size {} exceeds max_batch_size {}",
                        spec.name(),
                        batch,
                        max_batch_size
                    )));
                }
            }
        }
    }
    let mut unexpected: Vec<&String> = inputs
        .keys()
        .filter(|name| contract.input(name).is_none())
        .collect();
    unexpected.sort();
    match unexpected.first() {
        Some(name) => Err(Error::InvalidArgument(format!(
            "unexpected input '{}' for model '{}'",
            name,
            contract.model_name()
        ))),
        None => Ok(()),
    }
}

fn validate_requested_outputs(
    contract: &ModelContract,
    requested: &HashSet<String>,
) -> Result<(), Error> {
    let mut unknown: Vec<&String> = requested
        .iter()
        .filter(|name| contract.output(name).is_none())
        .collect();
    unknown.sort();
    match unknown.first() {
        Some(name) => Err(Error::InvalidArgument(format!(
            "unknown output '{}' requested from model '{}'",
            name,
            contract.model_name()
        ))),
        None => Ok(()),
    }
}

/// Every declared output must be present and well formed, otherwise the
/// executor broke its contract. Returns the requested subset.
fn check_outputs(
    contract: &ModelContract,
    mut produced: HashMap<String, Tensor>,
    requested: &HashSet<String>,
) -> Result<HashMap<String, Tensor>, Error> {
    let mut outputs = HashMap::new();
    for spec in contract.outputs() {
        let tensor = produced.remove(spec.name()).ok_or_else(|| {
            Error::Internal(format!(
                "model '{}' did not produce output '{}'",
                contract.model_name(),
                spec.name()
            ))
        })?;
        spec.check(&tensor).map_err(|mismatch| {
            Error::Internal(format!(
                "model '{}' output '{}': {}",
                contract.model_name(),
                spec.name(),
                mismatch
            ))
        })?;
        if requested.is_empty() || requested.contains(spec.name()) {
            outputs.insert(spec.name().to_string(), tensor.renamed(spec.name()));
        }
    }
    if !produced.is_empty() {
        log::debug!(
            "Model {} produced {} undeclared outputs, ignored",
            contract.model_name(),
            produced.len()
        );
    }
    Ok(outputs)
}
