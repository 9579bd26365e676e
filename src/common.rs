use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = smallvec::SmallVec<[DimSize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    Float64,
    Int32,
}

/// How a buffer is used by the program.
///
/// Inputs are supplied pre-populated by the caller and are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    Input,
    Output,
    Temporary,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match &self {
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Float64 => 8,
        }
    }

    /// Rounds `value` to the nearest value representable in this Dtype, the way a C
    /// store of a `double` into it would.
    pub fn round(&self, value: f64) -> f64 {
        match self {
            Dtype::Float32 => f64::from(value as f32),
            Dtype::Float64 => value,
            Dtype::Int32 => f64::from(value as i32),
        }
    }

    pub fn c_type(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float",
            Dtype::Float64 => "double",
            Dtype::Int32 => "int32_t",
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Float64 => write!(f, "f64"),
            Dtype::Int32 => write!(f, "i32"),
        }
    }
}
