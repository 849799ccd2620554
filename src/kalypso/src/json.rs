//! JSON bodies of the HTTP protocol, shared by the server and the client,
//! and their conversion to and from [`Tensor`].
use kalypso_contract::{ContractError, DataType, Element, Tensor, TensorSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;

/// A tensor with its data as a JSON array, row-major. Nested arrays are
/// flattened on decode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JsonTensor {
    /// tensor name
    pub name: String,
    /// concrete shape
    pub shape: Vec<i64>,
    /// wire datatype, e.g. `FP32`
    pub datatype: String,
    /// numbers, booleans or strings for `BYTES`
    pub data: Value,
}

/// Output selection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestedOutput {
    /// output name
    pub name: String,
}

/// Body of `POST .../infer`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct InferRequestBody {
    /// echoed in the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// inputs
    pub inputs: Vec<JsonTensor>,
    /// outputs to return, all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<RequestedOutput>,
}

/// Successful infer response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InferResponseBody {
    /// model name
    pub model_name: String,
    /// version that served the request
    pub model_version: String,
    /// request id, if one was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// outputs
    pub outputs: Vec<JsonTensor>,
}

/// Declared input or output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorMetadata {
    /// name
    pub name: String,
    /// wire datatype
    pub datatype: String,
    /// -1 for wildcard dimensions
    pub shape: Vec<i64>,
}

impl From<&TensorSpec> for TensorMetadata {
    fn from(spec: &TensorSpec) -> Self {
        TensorMetadata {
            name: spec.name().to_string(),
            datatype: spec.datatype().to_string(),
            shape: spec.shape().to_dims(),
        }
    }
}

/// `GET /v2/models/{name}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelMetadataBody {
    /// model name
    pub name: String,
    /// known versions
    pub versions: Vec<String>,
    /// serving platform
    pub platform: String,
    /// inputs
    pub inputs: Vec<TensorMetadata>,
    /// outputs
    pub outputs: Vec<TensorMetadata>,
}

/// `GET /v2`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerMetadataBody {
    /// server name
    pub name: String,
    /// server version
    pub version: String,
    /// protocol extensions
    pub extensions: Vec<String>,
}

/// One row of the repository index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// model name
    pub name: String,
    /// version
    pub version: String,
    /// readiness, lower case
    pub state: String,
}

/// Body of every error response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    /// message
    pub error: String,
}

/// A JSON tensor that cannot be converted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JsonError {
    /// datatype or shape problem
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// element of the wrong kind or out of range
    #[error("tensor '{name}': {reason}")]
    Data {
        /// tensor name
        name: String,
        /// what was wrong
        reason: String,
    },
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        other => out.push(other),
    }
}

impl JsonTensor {
    /// Decode into a tensor, checking every element against the datatype.
    pub fn to_tensor(&self) -> Result<Tensor, JsonError> {
        let datatype: DataType = self.datatype.parse()?;
        let mut values = Vec::new();
        flatten(&self.data, &mut values);
        let name = self.name.as_str();
        let shape = self.shape.clone();
        let tensor = match datatype {
            DataType::Bool => {
                Tensor::from_slice(name, shape, &self.collect(&values, Value::as_bool, "booleans")?)
            }
            DataType::Uint8 => Tensor::from_slice(name, shape, &self.integers::<u8>(&values)?),
            DataType::Int8 => Tensor::from_slice(name, shape, &self.integers::<i8>(&values)?),
            DataType::Int16 => Tensor::from_slice(name, shape, &self.integers::<i16>(&values)?),
            DataType::Int32 => Tensor::from_slice(name, shape, &self.integers::<i32>(&values)?),
            DataType::Int64 => Tensor::from_slice(name, shape, &self.integers::<i64>(&values)?),
            DataType::Fp32 => Tensor::from_slice(name, shape, &self.singles(&values)?),
            DataType::Fp64 => {
                Tensor::from_slice(name, shape, &self.collect(&values, Value::as_f64, "numbers")?)
            }
            DataType::Bytes => {
                Tensor::from_strings(name, shape, &self.collect(&values, Value::as_str, "strings")?)
            }
            DataType::Fp16 => {
                return Err(JsonError::Data {
                    name: self.name.clone(),
                    reason: "FP16 has no JSON representation".to_string(),
                })
            }
        }?;
        Ok(tensor)
    }

    fn collect<'a, T>(
        &self,
        values: &[&'a Value],
        get: impl Fn(&'a Value) -> Option<T>,
        expected: &str,
    ) -> Result<Vec<T>, JsonError> {
        values
            .iter()
            .map(|&value| {
                get(value).ok_or_else(|| JsonError::Data {
                    name: self.name.clone(),
                    reason: format!("expected {}, found {}", expected, value),
                })
            })
            .collect()
    }

    fn integers<T: TryFrom<i64>>(&self, values: &[&Value]) -> Result<Vec<T>, JsonError> {
        self.collect(values, Value::as_i64, "integers")?
            .into_iter()
            .map(|v| {
                T::try_from(v).map_err(|_| JsonError::Data {
                    name: self.name.clone(),
                    reason: format!("{} is out of range for {}", v, self.datatype),
                })
            })
            .collect()
    }

    fn singles(&self, values: &[&Value]) -> Result<Vec<f32>, JsonError> {
        self.collect(values, Value::as_f64, "numbers")?
            .into_iter()
            .map(|v| match v as f32 {
                single if single.is_finite() => Ok(single),
                _ => Err(JsonError::Data {
                    name: self.name.clone(),
                    reason: format!("{} is out of range for {}", v, self.datatype),
                }),
            })
            .collect()
    }

    /// Encode a tensor. `FP16` has no JSON form and is rejected.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, JsonError> {
        let data = match tensor.datatype() {
            DataType::Bool => values::<bool>(tensor)?,
            DataType::Uint8 => values::<u8>(tensor)?,
            DataType::Int8 => values::<i8>(tensor)?,
            DataType::Int16 => values::<i16>(tensor)?,
            DataType::Int32 => values::<i32>(tensor)?,
            DataType::Int64 => values::<i64>(tensor)?,
            DataType::Fp32 => values::<f32>(tensor)?,
            DataType::Fp64 => values::<f64>(tensor)?,
            DataType::Bytes => tensor
                .to_strings()?
                .iter()
                .map(|s| Value::from(String::from_utf8_lossy(s).into_owned()))
                .collect(),
            DataType::Fp16 => {
                return Err(JsonError::Data {
                    name: tensor.name().to_string(),
                    reason: "FP16 has no JSON representation".to_string(),
                })
            }
        };
        Ok(JsonTensor {
            name: tensor.name().to_string(),
            shape: tensor.shape().to_vec(),
            datatype: tensor.datatype().to_string(),
            data: Value::Array(data),
        })
    }
}

fn values<T: Element + Into<Value>>(tensor: &Tensor) -> Result<Vec<Value>, JsonError> {
    Ok(tensor.to_vec::<T>()?.into_iter().map(Into::into).collect())
}
