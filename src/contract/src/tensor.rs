use crate::{
    utils::{self, Element},
    ContractError, DataType,
};

/// A named, typed, shaped buffer. The buffer always agrees with the shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    name: String,
    datatype: DataType,
    shape: Vec<i64>,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor, checking that `data` holds exactly the elements `shape` describes.
    pub fn new(
        name: impl Into<String>,
        datatype: DataType,
        shape: Vec<i64>,
        data: Vec<u8>,
    ) -> Result<Self, ContractError> {
        let name = name.into();
        let count = match utils::element_count(&shape) {
            Some(count) => count,
            None => return Err(ContractError::InvalidShape { name, shape }),
        };
        let consistent = match datatype.element_size() {
            Some(size) => count.checked_mul(size) == Some(data.len()),
            None => utils::decode_strings(&data).map(|items| items.len()) == Some(count),
        };
        if !consistent {
            return Err(ContractError::ShapeMismatch {
                name,
                datatype,
                actual: data.len(),
                shape,
            });
        }
        Ok(Tensor {
            name,
            datatype,
            shape,
            data,
        })
    }

    /// Tensor from typed values.
    pub fn from_slice<T: Element>(
        name: impl Into<String>,
        shape: Vec<i64>,
        values: &[T],
    ) -> Result<Self, ContractError> {
        Tensor::new(name, T::DATATYPE, shape, utils::vec_to_bytes(values))
    }

    /// `BYTES` tensor from strings.
    pub fn from_strings<S: AsRef<[u8]>>(
        name: impl Into<String>,
        shape: Vec<i64>,
        values: &[S],
    ) -> Result<Self, ContractError> {
        Tensor::new(name, DataType::Bytes, shape, utils::encode_strings(values))
    }

    /// Typed copy of the elements.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ContractError> {
        self.expect_datatype(T::DATATYPE)?;
        Ok(utils::bytes_to_vec(&self.data))
    }

    /// Elements of a `BYTES` tensor.
    pub fn to_strings(&self) -> Result<Vec<Vec<u8>>, ContractError> {
        self.expect_datatype(DataType::Bytes)?;
        // construction guarantees a well-formed buffer
        Ok(utils::decode_strings(&self.data).unwrap_or_default())
    }

    fn expect_datatype(&self, expected: DataType) -> Result<(), ContractError> {
        if self.datatype != expected {
            return Err(ContractError::TypeMismatch {
                name: self.name.clone(),
                expected,
                actual: self.datatype,
            });
        }
        Ok(())
    }

    /// Same tensor under another name.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Datatype
    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Concrete shape
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Raw little-endian buffer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the raw buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Number of elements, 1 for a scalar.
    pub fn element_count(&self) -> usize {
        // checked at construction
        utils::element_count(&self.shape).unwrap_or_default()
    }
}
