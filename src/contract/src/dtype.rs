use crate::ContractError;
use std::{fmt, str::FromStr};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// one byte, 0 or 1
    Bool,
    /// u8
    Uint8,
    /// i8
    Int8,
    /// i16
    Int16,
    /// i32
    Int32,
    /// i64
    Int64,
    /// IEEE half precision, carried as raw bytes
    Fp16,
    /// f32
    Fp32,
    /// f64
    Fp64,
    /// Variable length byte strings, each prefixed by a u32 length.
    Bytes,
}

impl DataType {
    /// Size of one element in bytes, None for variable length types.
    pub fn element_size(self) -> Option<usize> {
        use DataType::*;
        match self {
            Bool | Uint8 | Int8 => Some(1),
            Int16 | Fp16 => Some(2),
            Int32 | Fp32 => Some(4),
            Int64 | Fp64 => Some(8),
            Bytes => None,
        }
    }

    /// Wire name, e.g. `FP32`.
    pub fn as_str(self) -> &'static str {
        use DataType::*;
        match self {
            Bool => "BOOL",
            Uint8 => "UINT8",
            Int8 => "INT8",
            Int16 => "INT16",
            Int32 => "INT32",
            Int64 => "INT64",
            Fp16 => "FP16",
            Fp32 => "FP32",
            Fp64 => "FP64",
            Bytes => "BYTES",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ContractError;

    /// Accepts wire names (`FP32`) and model config names (`TYPE_FP32`).
    /// `STRING` is an alias of `BYTES`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DataType::*;
        let name = s.strip_prefix("TYPE_").unwrap_or(s);
        let dtype = match name {
            "BOOL" => Bool,
            "UINT8" => Uint8,
            "INT8" => Int8,
            "INT16" => Int16,
            "INT32" => Int32,
            "INT64" => Int64,
            "FP16" => Fp16,
            "FP32" => Fp32,
            "FP64" => Fp64,
            "BYTES" | "STRING" => Bytes,
            _ => return Err(ContractError::UnknownDataType(s.to_string())),
        };
        Ok(dtype)
    }
}
