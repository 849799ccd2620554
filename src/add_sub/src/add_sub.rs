use dispatcher::{ExecutionError, Executor, ExecutorRequest, ExecutorResponse, InitError};
use kalypso_contract::{ContractError, DataType, ModelContract, Tensor};
use std::convert::TryFrom;

const INPUT0: &str = "INPUT0";
const INPUT1: &str = "INPUT1";
const OUTPUT0: &str = "OUTPUT0";
const OUTPUT1: &str = "OUTPUT1";

/// Elementwise model: `OUTPUT0 = INPUT0 + INPUT1`, `OUTPUT1 = INPUT0 - INPUT1`.
///
/// Inputs may be any integer or FP32/FP64 type. Integer arithmetic is
/// checked, float arithmetic is done in f64. Results are cast to the
/// datatype each output declares; a value that does not fit is rejected
/// instead of wrapped.
#[derive(Default)]
pub struct AddSub {
    output0: Option<DataType>,
    output1: Option<DataType>,
}

impl AddSub {
    /// Uninitialized executor
    pub fn new() -> Self {
        AddSub::default()
    }
}

impl Executor for AddSub {
    fn initialize(&mut self, contract: &ModelContract) -> Result<(), InitError> {
        for name in &[INPUT0, INPUT1] {
            let spec = contract
                .input(name)
                .ok_or_else(|| InitError(format!("model has no input '{}'", name)))?;
            supported(spec.datatype())?;
        }
        let output_type = |name: &str| -> Result<DataType, InitError> {
            let spec = contract
                .output(name)
                .ok_or_else(|| InitError(format!("model has no output '{}'", name)))?;
            supported(spec.datatype())?;
            Ok(spec.datatype())
        };
        self.output0 = Some(output_type(OUTPUT0)?);
        self.output1 = Some(output_type(OUTPUT1)?);
        log::debug!(
            "add_sub {} version {} initialized",
            contract.model_name(),
            contract.version()
        );
        Ok(())
    }

    fn execute(
        &self,
        requests: Vec<ExecutorRequest>,
    ) -> Result<Vec<ExecutorResponse>, ExecutionError> {
        let (output0, output1) = match (self.output0, self.output1) {
            (Some(output0), Some(output1)) => (output0, output1),
            _ => return Err(ExecutionError::Failed("not initialized".to_string())),
        };
        requests
            .iter()
            .map(|request| {
                let a = input(request, INPUT0)?;
                let b = input(request, INPUT1)?;
                if a.shape() != b.shape() {
                    return Err(ExecutionError::InvalidArgument(format!(
                        "{} shape {:?} and {} shape {:?} differ",
                        INPUT0,
                        a.shape(),
                        INPUT1,
                        b.shape()
                    )));
                }
                let (x, y) = (Values::read(a)?, Values::read(b)?);
                let sum = x.combine(&y, OUTPUT0, i64::checked_add, |a, b| a + b)?;
                let diff = x.combine(&y, OUTPUT1, i64::checked_sub, |a, b| a - b)?;
                Ok(ExecutorResponse::from_tensors(vec![
                    sum.write(OUTPUT0, output0, a.shape().to_vec())?,
                    diff.write(OUTPUT1, output1, a.shape().to_vec())?,
                ]))
            })
            .collect()
    }
}

fn supported(datatype: DataType) -> Result<(), InitError> {
    match datatype {
        DataType::Bool | DataType::Fp16 | DataType::Bytes => Err(InitError(format!(
            "add_sub does not support datatype {}",
            datatype
        ))),
        _ => Ok(()),
    }
}

fn input<'a>(request: &'a ExecutorRequest, name: &str) -> Result<&'a Tensor, ExecutionError> {
    request
        .input(name)
        .ok_or_else(|| ExecutionError::InvalidArgument(format!("missing input '{}'", name)))
}

fn failed(err: ContractError) -> ExecutionError {
    ExecutionError::Failed(err.to_string())
}

/// Elements widened to a common representation.
#[derive(Debug, PartialEq)]
enum Values {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

fn widen<T: kalypso_contract::Element, U: From<T>>(tensor: &Tensor) -> Result<Vec<U>, ExecutionError> {
    Ok(tensor
        .to_vec::<T>()
        .map_err(failed)?
        .into_iter()
        .map(U::from)
        .collect())
}

impl Values {
    fn read(tensor: &Tensor) -> Result<Self, ExecutionError> {
        let values = match tensor.datatype() {
            DataType::Uint8 => Values::Int(widen::<u8, i64>(tensor)?),
            DataType::Int8 => Values::Int(widen::<i8, i64>(tensor)?),
            DataType::Int16 => Values::Int(widen::<i16, i64>(tensor)?),
            DataType::Int32 => Values::Int(widen::<i32, i64>(tensor)?),
            DataType::Int64 => Values::Int(widen::<i64, i64>(tensor)?),
            DataType::Fp32 => Values::Float(widen::<f32, f64>(tensor)?),
            DataType::Fp64 => Values::Float(widen::<f64, f64>(tensor)?),
            other => {
                return Err(ExecutionError::InvalidArgument(format!(
                    "tensor '{}': datatype {} is not supported",
                    tensor.name(),
                    other
                )))
            }
        };
        Ok(values)
    }

    fn len(&self) -> usize {
        match self {
            Values::Int(v) => v.len(),
            Values::Float(v) => v.len(),
        }
    }

    fn to_float(&self) -> Vec<f64> {
        match self {
            Values::Int(v) => v.iter().map(|&x| x as f64).collect(),
            Values::Float(v) => v.clone(),
        }
    }

    /// Integers stay integers when both sides are; anything else goes through f64.
    fn combine(
        &self,
        other: &Values,
        output: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Values, ExecutionError> {
        if self.len() != other.len() {
            return Err(ExecutionError::InvalidArgument(format!(
                "{} has {} elements but {} has {}",
                INPUT0,
                self.len(),
                INPUT1,
                other.len()
            )));
        }
        match (self, other) {
            (Values::Int(a), Values::Int(b)) => a
                .iter()
                .zip(b)
                .map(|(&a, &b)| {
                    int_op(a, b).ok_or_else(|| {
                        ExecutionError::InvalidArgument(format!(
                            "{} overflows for elements {} and {}",
                            output, a, b
                        ))
                    })
                })
                .collect::<Result<_, _>>()
                .map(Values::Int),
            _ => Ok(Values::Float(
                self.to_float()
                    .iter()
                    .zip(other.to_float())
                    .map(|(&a, b)| float_op(a, b))
                    .collect(),
            )),
        }
    }

    fn write(&self, name: &str, datatype: DataType, shape: Vec<i64>) -> Result<Tensor, ExecutionError> {
        let tensor = match datatype {
            DataType::Uint8 => Tensor::from_slice(name, shape, &self.cast::<u8>(name, datatype)?),
            DataType::Int8 => Tensor::from_slice(name, shape, &self.cast::<i8>(name, datatype)?),
            DataType::Int16 => Tensor::from_slice(name, shape, &self.cast::<i16>(name, datatype)?),
            DataType::Int32 => Tensor::from_slice(name, shape, &self.cast::<i32>(name, datatype)?),
            DataType::Int64 => Tensor::from_slice(name, shape, &self.cast::<i64>(name, datatype)?),
            DataType::Fp32 => {
                let values: Vec<f32> = self.to_float().into_iter().map(|v| v as f32).collect();
                Tensor::from_slice(name, shape, &values)
            }
            DataType::Fp64 => Tensor::from_slice(name, shape, &self.to_float()),
            other => {
                return Err(ExecutionError::Failed(format!(
                    "output '{}' has unsupported datatype {}",
                    name, other
                )))
            }
        };
        tensor.map_err(failed)
    }

    /// Integer cast; floats truncate toward zero. Out of range is an error.
    fn cast<T: TryFrom<i64>>(&self, name: &str, datatype: DataType) -> Result<Vec<T>, ExecutionError> {
        let out_of_range = |value: String| {
            ExecutionError::InvalidArgument(format!(
                "{} value {} does not fit in {}",
                name, value, datatype
            ))
        };
        match self {
            Values::Int(v) => v
                .iter()
                .map(|&x| T::try_from(x).map_err(|_| out_of_range(x.to_string())))
                .collect(),
            Values::Float(v) => v
                .iter()
                .map(|&x| {
                    let t = x.trunc();
                    // i64::MIN is exactly representable, i64::MAX is not
                    if !t.is_finite() || t < i64::MIN as f64 || t >= -(i64::MIN as f64) {
                        return Err(out_of_range(x.to_string()));
                    }
                    T::try_from(t as i64).map_err(|_| out_of_range(x.to_string()))
                })
                .collect(),
        }
    }
}
