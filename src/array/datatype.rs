//! # Datatype Descriptor
//!
//! The canonical cell datatype tag, used by dimensions and attributes.
//! All per-type behavior (size, comparison, integer widening) runs
//! through one generic path dispatched on this tag: domain bounds, tile
//! extents, and MBRs are stored as raw little-endian bytes everywhere and
//! interpreted only here. There are no per-type code paths elsewhere in
//! the crate.
//!
//! `#[repr(u8)]` keeps the discriminant stable for the on-disk encoding.

use std::cmp::Ordering;

use eyre::Result;

use crate::error::StorageError;

/// Cell datatype tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int8 = 0,
    UInt8 = 1,
    Int16 = 2,
    UInt16 = 3,
    Int32 = 4,
    UInt32 = 5,
    Int64 = 6,
    UInt64 = 7,
    Float32 = 8,
    Float64 = 9,
    Char = 10,
}

/// Native-cell glue for the generic dispatch: every supported cell type
/// decodes from little-endian bytes and compares.
trait NativeCell: Copy + PartialOrd {
    const SIZE: usize;
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! native_cell {
    ($($t:ty),*) => {
        $(
            impl NativeCell for $t {
                const SIZE: usize = std::mem::size_of::<$t>();
                fn decode(bytes: &[u8]) -> Self {
                    <$t>::from_le_bytes(bytes.try_into().expect("cell width checked by caller"))
                }
            }
        )*
    };
}

native_cell!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

fn cmp_as<T: NativeCell>(a: &[u8], b: &[u8]) -> Ordering {
    T::decode(a)
        .partial_cmp(&T::decode(b))
        .unwrap_or(Ordering::Equal)
}

impl Datatype {
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Int8,
            1 => Self::UInt8,
            2 => Self::Int16,
            3 => Self::UInt16,
            4 => Self::Int32,
            5 => Self::UInt32,
            6 => Self::Int64,
            7 => Self::UInt64,
            8 => Self::Float32,
            9 => Self::Float64,
            10 => Self::Char,
            other => eyre::bail!(StorageError::InvalidArgument(format!(
                "unknown datatype tag {other}"
            ))),
        })
    }

    /// Size in bytes of one cell value.
    pub fn size(&self) -> u64 {
        match self {
            Self::Int8 | Self::UInt8 | Self::Char => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Int8 => "INT8",
            Self::UInt8 => "UINT8",
            Self::Int16 => "INT16",
            Self::UInt16 => "UINT16",
            Self::Int32 => "INT32",
            Self::UInt32 => "UINT32",
            Self::Int64 => "INT64",
            Self::UInt64 => "UINT64",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::Char => "CHAR",
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64 | Self::Char)
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Dimensions must be numeric; dense arrays additionally require
    /// integer dimensions (enforced by the schema check).
    pub fn is_valid_dimension_type(&self) -> bool {
        !matches!(self, Self::Char)
    }

    /// Compares two raw cell values of this datatype. Both slices must be
    /// exactly [`Datatype::size`] bytes.
    pub fn cmp_cells(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert_eq!(a.len() as u64, self.size());
        debug_assert_eq!(b.len() as u64, self.size());
        match self {
            Self::Int8 => cmp_as::<i8>(a, b),
            Self::UInt8 | Self::Char => cmp_as::<u8>(a, b),
            Self::Int16 => cmp_as::<i16>(a, b),
            Self::UInt16 => cmp_as::<u16>(a, b),
            Self::Int32 => cmp_as::<i32>(a, b),
            Self::UInt32 => cmp_as::<u32>(a, b),
            Self::Int64 => cmp_as::<i64>(a, b),
            Self::UInt64 => cmp_as::<u64>(a, b),
            Self::Float32 => cmp_as::<f32>(a, b),
            Self::Float64 => cmp_as::<f64>(a, b),
        }
    }

    /// Widens an integer cell to i128 for coordinate arithmetic. Errors
    /// for real and character datatypes.
    pub fn cell_to_i128(&self, bytes: &[u8]) -> Result<i128> {
        if !self.is_integer() {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "datatype {} does not support integer coordinates",
                self.name()
            )));
        }
        debug_assert_eq!(bytes.len() as u64, self.size());
        Ok(match self {
            Self::Int8 => i8::decode(bytes) as i128,
            Self::UInt8 => u8::decode(bytes) as i128,
            Self::Int16 => i16::decode(bytes) as i128,
            Self::UInt16 => u16::decode(bytes) as i128,
            Self::Int32 => i32::decode(bytes) as i128,
            Self::UInt32 => u32::decode(bytes) as i128,
            Self::Int64 => i64::decode(bytes) as i128,
            Self::UInt64 => u64::decode(bytes) as i128,
            _ => unreachable!("is_integer checked above"),
        })
    }

    /// Narrows an i128 coordinate back to this datatype's little-endian
    /// cell encoding. Errors when the value does not fit.
    pub fn cell_from_i128(&self, value: i128) -> Result<Vec<u8>> {
        macro_rules! narrow {
            ($t:ty) => {
                <$t>::try_from(value)
                    .map(|v| v.to_le_bytes().to_vec())
                    .map_err(|_| {
                        eyre::eyre!(StorageError::InvalidArgument(format!(
                            "coordinate {value} out of range for {}",
                            self.name()
                        )))
                    })
            };
        }
        match self {
            Self::Int8 => narrow!(i8),
            Self::UInt8 => narrow!(u8),
            Self::Int16 => narrow!(i16),
            Self::UInt16 => narrow!(u16),
            Self::Int32 => narrow!(i32),
            Self::UInt32 => narrow!(u32),
            Self::Int64 => narrow!(i64),
            Self::UInt64 => narrow!(u64),
            _ => eyre::bail!(StorageError::InvalidArgument(format!(
                "datatype {} does not support integer coordinates",
                self.name()
            ))),
        }
    }
}
