use crate::{ContractError, DataType, ShapePattern, Tensor};
use std::{collections::HashSet, fmt};

/// Declared name, datatype and shape of one model input or output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    name: String,
    datatype: DataType,
    shape: ShapePattern,
}

/// Why a tensor does not satisfy a [`TensorSpec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mismatch {
    /// Wrong element type.
    DataType {
        /// declared
        expected: DataType,
        /// received
        actual: DataType,
    },
    /// Shape does not match the pattern.
    Shape {
        /// declared
        expected: ShapePattern,
        /// received
        actual: Vec<i64>,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::DataType { expected, actual } => {
                write!(f, "datatype mismatch, expected {} got {}", expected, actual)
            }
            Mismatch::Shape { expected, actual } => {
                write!(f, "shape mismatch, expected {} got {:?}", expected, actual)
            }
        }
    }
}

impl TensorSpec {
    /// Create a TensorSpec
    pub fn new(name: impl Into<String>, datatype: DataType, shape: ShapePattern) -> Self {
        TensorSpec {
            name: name.into(),
            datatype,
            shape,
        }
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Datatype
    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Shape pattern
    pub fn shape(&self) -> &ShapePattern {
        &self.shape
    }

    /// Datatype must be equal, shape must match the pattern.
    pub fn check(&self, tensor: &Tensor) -> Result<(), Mismatch> {
        if tensor.datatype() != self.datatype {
            return Err(Mismatch::DataType {
                expected: self.datatype,
                actual: tensor.datatype(),
            });
        }
        if !self.shape.matches(tensor.shape()) {
            return Err(Mismatch::Shape {
                expected: self.shape.clone(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// Inputs and outputs a model version guarantees. Immutable once loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelContract {
    model_name: String,
    version: u64,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    max_batch_size: u32,
}

impl ModelContract {
    /// Create a contract; tensor names must be unique among inputs and among outputs.
    pub fn new(
        model_name: impl Into<String>,
        version: u64,
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
    ) -> Result<Self, ContractError> {
        unique_names(&inputs)?;
        unique_names(&outputs)?;
        Ok(ModelContract {
            model_name: model_name.into(),
            version,
            inputs,
            outputs,
            max_batch_size: 0,
        })
    }

    /// Upper bound on the leading dimension, 0 disables the check.
    pub fn with_max_batch_size(mut self, max_batch_size: u32) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Model name
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Declared inputs, in order.
    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    /// Declared outputs, in order.
    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    /// Max batch size, 0 when the model does not batch.
    pub fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    /// Look up an input spec by name.
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    /// Look up an output spec by name.
    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|spec| spec.name == name)
    }
}

fn unique_names(specs: &[TensorSpec]) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            return Err(ContractError::DuplicateName(spec.name.clone()));
        }
    }
    Ok(())
}
