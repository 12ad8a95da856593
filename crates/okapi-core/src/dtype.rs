use crate::matrix::HostData;
use std::fmt;

// DType — Supported element types
//
// Every matrix has a DType that determines its element size and numeric
// behavior. This engine works with explicit matrix primitives, not a general
// tensor algebra, so the set is deliberately small:
//
//   F32 — 32-bit float, the workhorse for values and gradients
//   I32 — signed 32-bit int, for index columns and integer labels

/// Enum of all supported element data types.
///
/// Stored inside every [`crate::Matrix`] so operations can dispatch to the
/// correct typed implementation at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
        }
    }

    /// Whether this dtype participates in arithmetic kernels. Integer
    /// matrices are carriers for indices/labels only.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Bridge between Rust element types and the DType enum
//
// Lets host-transfer helpers be written generically: HostMatrix::from_vec
// takes a Vec<T: WithDType> and derives the runtime DType (and HostData
// wrapper) from T.

/// Trait implemented by Rust types that can live in a matrix.
pub trait WithDType: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn wrap(data: Vec<Self>) -> HostData;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;

    fn wrap(data: Vec<f32>) -> HostData {
        HostData::F32(data)
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;

    fn wrap(data: Vec<i32>) -> HostData {
        HostData::I32(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_float() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert!(DType::F32.is_float());
        assert!(!DType::I32.is_float());
    }

    #[test]
    fn display() {
        assert_eq!(DType::F32.to_string(), "f32");
        assert_eq!(DType::I32.to_string(), "i32");
    }
}
