//! Tensor element types and their wire tags.

use std::fmt;

/// Element type of a tensor, carried on the wire as an `i32` tag.
///
/// Tags outside the known table are kept as [`DataType::Unknown`] so that a
/// runtime reporting an exotic type does not abort the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Double,
    Uint32,
    Uint64,
    Unknown(i32),
}

impl DataType {
    /// Map a wire tag to a data type.
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            1 => Self::Float32,
            2 => Self::Uint8,
            3 => Self::Int8,
            4 => Self::Uint16,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Int64,
            8 => Self::String,
            9 => Self::Bool,
            11 => Self::Double,
            12 => Self::Uint32,
            13 => Self::Uint64,
            other => Self::Unknown(other),
        }
    }

    /// Wire tag for this data type.
    pub fn tag(self) -> i32 {
        match self {
            Self::Float32 => 1,
            Self::Uint8 => 2,
            Self::Int8 => 3,
            Self::Uint16 => 4,
            Self::Int16 => 5,
            Self::Int32 => 6,
            Self::Int64 => 7,
            Self::String => 8,
            Self::Bool => 9,
            Self::Double => 11,
            Self::Uint32 => 12,
            Self::Uint64 => 13,
            Self::Unknown(tag) => tag,
        }
    }

    /// Size of one element in bytes, `None` for unknown tags.
    ///
    /// Strings are treated as raw bytes with no NUL accounting.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool | Self::String => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Float32 | Self::Int32 | Self::Uint32 => Some(4),
            Self::Int64 | Self::Double | Self::Uint64 => Some(8),
            Self::Unknown(_) => None,
        }
    }

    /// Width used by the response encoder.
    ///
    /// The response schema only knows float32, uint8, int8, int32, int64,
    /// string, bool and double. Everything else returns `None` and the tensor
    /// is left out of the `Outputs` map.
    pub fn response_width(self) -> Option<usize> {
        match self {
            Self::Float32
            | Self::Uint8
            | Self::Int8
            | Self::Int32
            | Self::Int64
            | Self::String
            | Self::Bool
            | Self::Double => self.width(),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Uint8 => write!(f, "uint8"),
            Self::Int8 => write!(f, "int8"),
            Self::Uint16 => write!(f, "uint16"),
            Self::Int16 => write!(f, "int16"),
            Self::Int32 => write!(f, "int32"),
            Self::Int64 => write!(f, "int64"),
            Self::String => write!(f, "string"),
            Self::Bool => write!(f, "bool"),
            Self::Double => write!(f, "double"),
            Self::Uint32 => write!(f, "uint32"),
            Self::Uint64 => write!(f, "uint64"),
            Self::Unknown(tag) => write!(f, "unknown({})", tag),
        }
    }
}
