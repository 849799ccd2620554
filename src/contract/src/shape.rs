use crate::ContractError;
use std::fmt;

/// One slot of a shape pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Wildcard, sized per request. Written as `-1`.
    Any,
    /// Exact length.
    Fixed(u64),
}

/// Declared shape of a tensor in a contract.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapePattern(Vec<Dim>);

impl ShapePattern {
    /// Create a pattern from dims.
    pub fn new(dims: Vec<Dim>) -> Self {
        ShapePattern(dims)
    }

    /// Parse the `-1`-for-wildcard notation used by model configs and wire metadata.
    pub fn from_dims(dims: &[i64]) -> Result<Self, ContractError> {
        dims.iter()
            .map(|&d| match d {
                -1 => Ok(Dim::Any),
                d if d >= 0 => Ok(Dim::Fixed(d as u64)),
                d => Err(ContractError::InvalidPattern(d)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ShapePattern)
    }

    /// Dimensions
    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// Rank
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Back to `-1` notation.
    pub fn to_dims(&self) -> Vec<i64> {
        self.0
            .iter()
            .map(|d| match d {
                Dim::Any => -1,
                Dim::Fixed(n) => *n as i64,
            })
            .collect()
    }

    /// Prepend a wildcard batch dimension.
    pub fn batched(&self) -> Self {
        let mut dims = Vec::with_capacity(self.0.len() + 1);
        dims.push(Dim::Any);
        dims.extend_from_slice(&self.0);
        ShapePattern(dims)
    }

    /// Equal rank, wildcards accept any length >= 1, fixed dims must be equal.
    pub fn matches(&self, shape: &[i64]) -> bool {
        self.0.len() == shape.len()
            && self.0.iter().zip(shape).all(|(dim, &actual)| match dim {
                Dim::Any => actual >= 1,
                Dim::Fixed(n) => actual >= 0 && actual as u64 == *n,
            })
    }
}

impl fmt::Display for ShapePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.to_dims().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_matches() {
        let pattern = ShapePattern::from_dims(&[-1, 4]).unwrap();
        assert!(pattern.matches(&[1, 4]));
        assert!(pattern.matches(&[16, 4]));
        assert!(!pattern.matches(&[0, 4]));
        assert!(!pattern.matches(&[2, 3]));
        assert!(!pattern.matches(&[3]));
        assert!(!pattern.matches(&[1, 4, 1]));
        assert!(ShapePattern::new(vec![]).matches(&[]));
    }

    #[test]
    fn test_notation() {
        assert_eq!(
            ShapePattern::from_dims(&[-2]),
            Err(ContractError::InvalidPattern(-2))
        );
        let pattern = ShapePattern::from_dims(&[4]).unwrap().batched();
        assert_eq!(pattern.dims(), &[Dim::Any, Dim::Fixed(4)]);
        assert_eq!(pattern.to_string(), "[-1,4]");
    }
}
