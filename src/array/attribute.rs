//! # Attributes
//!
//! An attribute names one value stored per cell: datatype, values per
//! cell (with a sentinel for variable length), and the filter pipeline
//! tags applied to its tiles. Filter execution is a codec concern outside
//! this crate; the tags are carried and persisted so the pipeline survives
//! a round trip.

use eyre::Result;

use super::datatype::Datatype;
use crate::config::{CELL_VAR_NUM, MAX_NAME_LEN};
use crate::error::StorageError;

/// Filter pipeline stage tag. Level semantics are codec-defined; `0`
/// means codec default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Gzip(i32),
    Zstd(i32),
    Lz4,
    Bzip2(i32),
    Rle,
    DoubleDelta,
}

impl Filter {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Gzip(_) => 0,
            Self::Zstd(_) => 1,
            Self::Lz4 => 2,
            Self::Bzip2(_) => 3,
            Self::Rle => 4,
            Self::DoubleDelta => 5,
        }
    }

    pub fn level(&self) -> i32 {
        match self {
            Self::Gzip(l) | Self::Zstd(l) | Self::Bzip2(l) => *l,
            _ => 0,
        }
    }

    pub fn from_parts(tag: u8, level: i32) -> Result<Self> {
        Ok(match tag {
            0 => Self::Gzip(level),
            1 => Self::Zstd(level),
            2 => Self::Lz4,
            3 => Self::Bzip2(level),
            4 => Self::Rle,
            5 => Self::DoubleDelta,
            other => eyre::bail!(StorageError::InvalidSchema(format!(
                "unknown filter tag {other}"
            ))),
        })
    }
}

/// One named value per cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: u32,
    filters: Vec<Filter>,
}

impl Attribute {
    /// Fixed-size attribute holding one value per cell.
    pub fn new(name: &str, datatype: Datatype) -> Result<Self> {
        Self::with_cell_val_num(name, datatype, 1)
    }

    /// Attribute with `cell_val_num` values per cell; pass
    /// [`CELL_VAR_NUM`] for variable length.
    pub fn with_cell_val_num(name: &str, datatype: Datatype, cell_val_num: u32) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "invalid attribute name '{name}'"
            )));
        }
        if cell_val_num == 0 {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "attribute '{name}': cell_val_num must be positive"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            datatype,
            cell_val_num,
            filters: Vec::new(),
        })
    }

    pub fn add_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn cell_val_num(&self) -> u32 {
        self.cell_val_num
    }

    pub fn is_var_sized(&self) -> bool {
        self.cell_val_num == CELL_VAR_NUM
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Bytes per cell, or `None` for variable-length attributes.
    pub fn cell_size(&self) -> Option<u64> {
        if self.is_var_sized() {
            None
        } else {
            Some(self.datatype.size() * self.cell_val_num as u64)
        }
    }
}
