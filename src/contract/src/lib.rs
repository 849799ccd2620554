#![deny(missing_docs)]
#![deny(warnings)]
#![warn(clippy::all)]

//! Value types shared by every layer of Kalypso: tensors, datatypes,
//! shape patterns and the input/output contract a model version declares.

mod contract;
mod dtype;
mod shape;
mod tensor;
pub mod utils;

pub use crate::contract::{Mismatch, ModelContract, TensorSpec};
pub use crate::dtype::DataType;
pub use crate::shape::{Dim, ShapePattern};
pub use crate::tensor::Tensor;
pub use crate::utils::Element;

/// Errors raised while constructing or reading contract values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// Buffer length disagrees with shape and datatype.
    #[error("tensor '{name}': {actual} bytes do not fit shape {shape:?} of {datatype}")]
    ShapeMismatch {
        /// Tensor name
        name: String,
        /// Declared datatype
        datatype: DataType,
        /// Declared shape
        shape: Vec<i64>,
        /// Actual buffer length in bytes
        actual: usize,
    },
    /// A concrete shape carried a negative dimension, or more elements than
    /// fit in memory.
    #[error("tensor '{name}': invalid shape {shape:?}")]
    InvalidShape {
        /// Tensor name
        name: String,
        /// Offending shape
        shape: Vec<i64>,
    },
    /// A shape pattern dimension below -1.
    #[error("invalid dimension {0} in shape pattern")]
    InvalidPattern(i64),
    /// Two tensors with the same name on one side of a contract.
    #[error("duplicate tensor name '{0}'")]
    DuplicateName(String),
    /// Datatype string not recognized.
    #[error("unknown datatype '{0}'")]
    UnknownDataType(String),
    /// Typed access with the wrong element type.
    #[error("tensor '{name}' is {actual}, not {expected}")]
    TypeMismatch {
        /// Tensor name
        name: String,
        /// Requested datatype
        expected: DataType,
        /// Stored datatype
        actual: DataType,
    },
}
