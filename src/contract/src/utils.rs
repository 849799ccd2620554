//! Basic utils for moving typed values in and out of little-endian tensor buffers.

use crate::DataType;
use std::{
    convert::{TryFrom, TryInto},
    mem,
};

/// Number of elements a concrete shape describes, None when a dimension is
/// negative or the product does not fit in `usize`.
pub fn element_count(shape: &[i64]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        usize::try_from(dim).ok().and_then(|dim| acc.checked_mul(dim))
    })
}

/// Fixed-size element that can live in a tensor buffer.
pub trait Element: Copy {
    /// Datatype tag stored in the tensor.
    const DATATYPE: DataType;
    /// Append the little-endian encoding.
    fn write_le(self, out: &mut Vec<u8>);
    /// Decode from exactly `size_of::<Self>()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! element {
    ($t:ty, $dtype:ident) => {
        impl Element for $t {
            const DATATYPE: DataType = DataType::$dtype;
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

element!(u8, Uint8);
element!(i8, Int8);
element!(i16, Int16);
element!(i32, Int32);
element!(i64, Int64);
element!(f32, Fp32);
element!(f64, Fp64);

impl Element for bool {
    const DATATYPE: DataType = DataType::Bool;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// &[T] to Vec<u8>
pub fn vec_to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * mem::size_of::<T>());
    for &v in values {
        v.write_le(&mut out);
    }
    out
}

/// &[u8] to Vec<T>, trailing bytes that do not form a whole element are ignored.
pub fn bytes_to_vec<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(mem::size_of::<T>())
        .map(T::read_le)
        .collect()
}

/// Serialize strings as `BYTES` elements: u32 little-endian length, then the bytes.
pub fn encode_strings<S: AsRef<[u8]>>(values: &[S]) -> Vec<u8> {
    let mut out = vec![];
    for v in values {
        let v = v.as_ref();
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        out.extend_from_slice(v);
    }
    out
}

/// Split a `BYTES` buffer into its elements, None if it is truncated.
pub fn decode_strings(mut bytes: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut out = vec![];
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return None;
        }
        let (len, rest) = bytes.split_at(4);
        let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
        if rest.len() < len {
            return None;
        }
        let (item, rest) = rest.split_at(len);
        out.push(item.to_vec());
        bytes = rest;
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_little_endian() {
        assert_eq!(vec_to_bytes(&[1i32, -1]), vec![1, 0, 0, 0, 255, 255, 255, 255]);
        assert_eq!(bytes_to_vec::<f32>(&vec_to_bytes(&[1.5f32, -2.0])), vec![1.5, -2.0]);
        assert_eq!(bytes_to_vec::<bool>(&[0, 1, 2]), vec![false, true, true]);
    }

    #[test]
    fn test_strings() {
        let bytes = encode_strings(&["ab", ""]);
        assert_eq!(bytes, vec![2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);
        assert_eq!(decode_strings(&bytes), Some(vec![b"ab".to_vec(), vec![]]));
        assert_eq!(decode_strings(&bytes[..5]), None);
        assert_eq!(decode_strings(&[1, 0]), None);
    }
}
