use dispatcher::{ExecutionError, Executor, ExecutorRequest, ExecutorResponse, InitError};
use kalypso_contract::ModelContract;

/// Copies the i-th declared input to the i-th declared output.
#[derive(Default)]
pub struct Identity {
    // (input, output) names
    pairs: Vec<(String, String)>,
}

impl Identity {
    /// Uninitialized executor
    pub fn new() -> Self {
        Identity::default()
    }
}

impl Executor for Identity {
    fn initialize(&mut self, contract: &ModelContract) -> Result<(), InitError> {
        if contract.inputs().len() != contract.outputs().len() {
            return Err(InitError(format!(
                "identity needs as many outputs as inputs, got {} and {}",
                contract.inputs().len(),
                contract.outputs().len()
            )));
        }
        self.pairs = contract
            .inputs()
            .iter()
            .zip(contract.outputs())
            .map(|(input, output)| {
                if input.datatype() != output.datatype() {
                    return Err(InitError(format!(
                        "input '{}' is {} but output '{}' is {}",
                        input.name(),
                        input.datatype(),
                        output.name(),
                        output.datatype()
                    )));
                }
                Ok((input.name().to_string(), output.name().to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        requests
            .into_iter()
            .map(|mut request| {
                let outputs = self
                    .pairs
                    .iter()
                    .map(|(input, output)| {
                        request
                            .inputs
                            .remove(input)
                            .map(|tensor| tensor.renamed(output.as_str()))
                            .ok_or_else(|| {
                                ExecutionError::InvalidArgument(format!(
                                    "missing input '{}'",
                                    input
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ExecutorResponse::from_tensors(outputs))
            })
            .collect()
    }
}
