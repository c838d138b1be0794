//! # Dimensions
//!
//! A dimension fixes one axis of an array: its name, datatype, inclusive
//! domain bounds, and tile extent. Bounds and extent are held as raw
//! little-endian cells and interpreted through the [`Datatype`]
//! descriptor, so one code path serves every numeric type.

use eyre::Result;

use super::datatype::Datatype;
use crate::config::MAX_NAME_LEN;
use crate::error::StorageError;

/// One axis of an array domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    datatype: Datatype,
    domain_lo: Vec<u8>,
    domain_hi: Vec<u8>,
    tile_extent: Vec<u8>,
}

impl Dimension {
    /// Builds a dimension from raw little-endian bound and extent cells.
    pub fn new(
        name: &str,
        datatype: Datatype,
        domain_lo: &[u8],
        domain_hi: &[u8],
        tile_extent: &[u8],
    ) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "invalid dimension name '{name}'"
            )));
        }
        if !datatype.is_valid_dimension_type() {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "datatype {} is not valid for dimensions",
                datatype.name()
            )));
        }
        let cell = datatype.size() as usize;
        if domain_lo.len() != cell || domain_hi.len() != cell || tile_extent.len() != cell {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "dimension '{name}': bounds and extent must each be {cell} bytes"
            )));
        }
        if datatype.cmp_cells(domain_lo, domain_hi) == std::cmp::Ordering::Greater {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "dimension '{name}': domain low bound exceeds high bound"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            datatype,
            domain_lo: domain_lo.to_vec(),
            domain_hi: domain_hi.to_vec(),
            tile_extent: tile_extent.to_vec(),
        })
    }

    /// Convenience constructor for integer dimensions.
    pub fn with_integer_domain(
        name: &str,
        datatype: Datatype,
        lo: i128,
        hi: i128,
        extent: i128,
    ) -> Result<Self> {
        if extent <= 0 {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "dimension '{name}': tile extent must be positive"
            )));
        }
        Self::new(
            name,
            datatype,
            &datatype.cell_from_i128(lo)?,
            &datatype.cell_from_i128(hi)?,
            &datatype.cell_from_i128(extent)?,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn domain_lo(&self) -> &[u8] {
        &self.domain_lo
    }

    pub fn domain_hi(&self) -> &[u8] {
        &self.domain_hi
    }

    pub fn tile_extent(&self) -> &[u8] {
        &self.tile_extent
    }

    /// Integer view of the domain, for coordinate arithmetic in the dense
    /// kernels.
    pub fn integer_domain(&self) -> Result<(i128, i128)> {
        Ok((
            self.datatype.cell_to_i128(&self.domain_lo)?,
            self.datatype.cell_to_i128(&self.domain_hi)?,
        ))
    }

    pub fn integer_extent(&self) -> Result<i128> {
        self.datatype.cell_to_i128(&self.tile_extent)
    }

    /// Number of cells along this axis.
    pub fn extent_cells(&self) -> Result<u64> {
        let (lo, hi) = self.integer_domain()?;
        Ok((hi - lo + 1) as u64)
    }

    /// Number of tiles along this axis (last tile may be partial).
    pub fn num_tiles(&self) -> Result<u64> {
        let cells = self.extent_cells()? as i128;
        let extent = self.integer_extent()?;
        Ok(((cells + extent - 1) / extent) as u64)
    }
}
