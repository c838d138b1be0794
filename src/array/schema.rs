//! # Array Schema
//!
//! The immutable type-and-layout description of an array: ordered
//! dimensions, ordered attributes, cell and tile order, tile capacity,
//! and the dense/sparse array type. A schema is validated once by
//! [`ArraySchema::check`] at construction/deserialization and never
//! mutated afterwards; open-array entries share it behind an `Arc`.
//!
//! ## File Format
//!
//! The schema file (`__array_schema.tsr`) is a 64-byte zerocopy header
//! followed by a little-endian length-prefixed body:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "TesseraSchema\0\0\0"
//! 16      4     Format version (u32)
//! 20      4     Flags (bit 0: key-value schema shape)
//! 24      32    Encryption key digest (zero when unencrypted)
//! 56      8     Body length (u64)
//! 64      ...   Body (see serialize)
//! ```

use eyre::{Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::attribute::{Attribute, Filter};
use super::datatype::Datatype;
use super::dimension::Dimension;
use crate::config::{FILE_HEADER_SIZE, FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION};
use crate::crypto::{EncryptionKey, KEY_DIGEST_LEN};
use crate::encoding::{ByteReader, ByteWriter};
use crate::error::StorageError;
use crate::zerocopy_getters;

pub const SCHEMA_MAGIC: &[u8; 16] = b"TesseraSchema\0\0\0";

const FLAG_KEY_VALUE: u32 = 1;

/// Cell or tile ordering within the array domain.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor = 0,
    ColMajor = 1,
}

impl Layout {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::RowMajor),
            1 => Ok(Self::ColMajor),
            other => eyre::bail!(StorageError::InvalidSchema(format!(
                "unknown layout tag {other}"
            ))),
        }
    }
}

/// Dense or sparse array.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayType {
    Dense = 0,
    Sparse = 1,
}

impl ArrayType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Dense),
            1 => Ok(Self::Sparse),
            other => eyre::bail!(StorageError::InvalidSchema(format!(
                "unknown array type tag {other}"
            ))),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SchemaFileHeader {
    magic: [u8; 16],
    version: U32,
    flags: U32,
    key_digest: [u8; KEY_DIGEST_LEN],
    body_len: U64,
}

const _: () = assert!(std::mem::size_of::<SchemaFileHeader>() == FILE_HEADER_SIZE);

impl SchemaFileHeader {
    fn new(flags: u32, key_digest: [u8; KEY_DIGEST_LEN], body_len: u64) -> Self {
        Self {
            magic: *SCHEMA_MAGIC,
            version: U32::new(FORMAT_VERSION),
            flags: U32::new(flags),
            key_digest,
            body_len: U64::new(body_len),
        }
    }

    zerocopy_getters! {
        version: u32,
        flags: u32,
        body_len: u64,
    }
}

/// Immutable array type-and-layout description.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    array_type: ArrayType,
    cell_order: Layout,
    tile_order: Layout,
    capacity: u64,
    key_value: bool,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    pub fn new(
        array_type: ArrayType,
        cell_order: Layout,
        tile_order: Layout,
        capacity: u64,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
    ) -> Result<Self> {
        let schema = Self {
            array_type,
            cell_order,
            tile_order,
            capacity,
            key_value: false,
            dimensions,
            attributes,
        };
        schema.check()?;
        Ok(schema)
    }

    /// Marks this schema as the reserved key-value shape.
    pub fn into_key_value(mut self) -> Self {
        self.key_value = true;
        self
    }

    /// Validates internal consistency. Called on construction and after
    /// deserialization; all other code may assume these properties.
    pub fn check(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            eyre::bail!(StorageError::InvalidSchema(
                "array must have at least one dimension".into()
            ));
        }
        if self.attributes.is_empty() {
            eyre::bail!(StorageError::InvalidSchema(
                "array must have at least one attribute".into()
            ));
        }
        if self.capacity == 0 {
            eyre::bail!(StorageError::InvalidSchema(
                "tile capacity must be positive".into()
            ));
        }

        let dim_type = self.dimensions[0].datatype();
        for dim in &self.dimensions {
            if dim.datatype() != dim_type {
                eyre::bail!(StorageError::InvalidSchema(format!(
                    "all dimensions must share one datatype; '{}' is {} but '{}' is {}",
                    self.dimensions[0].name(),
                    dim_type.name(),
                    dim.name(),
                    dim.datatype().name()
                )));
            }
        }
        if self.array_type == ArrayType::Dense && !dim_type.is_integer() {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "dense arrays require integer dimensions, got {}",
                dim_type.name()
            )));
        }

        let mut names: Vec<&str> = self
            .dimensions
            .iter()
            .map(Dimension::name)
            .chain(self.attributes.iter().map(Attribute::name))
            .collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            eyre::bail!(StorageError::InvalidSchema(format!(
                "duplicate dimension/attribute name '{}'",
                w[0]
            )));
        }
        Ok(())
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn is_dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    pub fn is_key_value(&self) -> bool {
        self.key_value
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    pub fn coords_type(&self) -> Datatype {
        self.dimensions[0].datatype()
    }

    /// Cells per full tile, the product of the tile extents.
    pub fn cells_per_tile(&self) -> Result<u64> {
        let mut cells = 1u64;
        for dim in &self.dimensions {
            cells = cells.saturating_mul(self.coords_type().cell_to_i128(dim.tile_extent())? as u64);
        }
        Ok(cells)
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub fn serialize(&self, key: &EncryptionKey) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(self.array_type as u8);
        w.put_u8(self.cell_order as u8);
        w.put_u8(self.tile_order as u8);
        w.put_u64(self.capacity);

        w.put_u32(self.dimensions.len() as u32);
        for dim in &self.dimensions {
            w.put_str(dim.name());
            w.put_u8(dim.datatype() as u8);
            w.put_bytes(dim.domain_lo());
            w.put_bytes(dim.domain_hi());
            w.put_bytes(dim.tile_extent());
        }

        w.put_u32(self.attributes.len() as u32);
        for attr in &self.attributes {
            w.put_str(attr.name());
            w.put_u8(attr.datatype() as u8);
            w.put_u32(attr.cell_val_num());
            w.put_u16(attr.filters().len() as u16);
            for f in attr.filters() {
                w.put_u8(f.tag());
                w.put_i32(f.level());
            }
        }

        let body = w.into_bytes();
        let flags = if self.key_value { FLAG_KEY_VALUE } else { 0 };
        let header = SchemaFileHeader::new(flags, key.digest(), body.len() as u64);

        let mut out = Vec::with_capacity(FILE_HEADER_SIZE + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn deserialize(bytes: &[u8], key: &EncryptionKey) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            eyre::bail!(StorageError::InvalidSchema(
                "schema file shorter than its header".into()
            ));
        }
        let header = SchemaFileHeader::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!(StorageError::InvalidSchema(format!("bad header: {e:?}"))))?;

        if &header.magic != SCHEMA_MAGIC {
            eyre::bail!(StorageError::InvalidSchema(
                "bad magic bytes in schema file".into()
            ));
        }
        let version = header.version();
        if !(MIN_SUPPORTED_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            eyre::bail!(StorageError::UnsupportedVersion(format!(
                "schema format version {version}, supported {MIN_SUPPORTED_FORMAT_VERSION}..={FORMAT_VERSION}"
            )));
        }
        key.check_digest(&header.key_digest, "array schema")?;

        let body_len = header.body_len() as usize;
        if bytes.len() < FILE_HEADER_SIZE + body_len {
            eyre::bail!(StorageError::InvalidSchema(
                "schema file truncated".into()
            ));
        }

        let mut r = ByteReader::new(&bytes[FILE_HEADER_SIZE..FILE_HEADER_SIZE + body_len]);
        let parse = |r: &mut ByteReader<'_>| -> Result<Self> {
            let array_type = ArrayType::from_u8(r.get_u8()?)?;
            let cell_order = Layout::from_u8(r.get_u8()?)?;
            let tile_order = Layout::from_u8(r.get_u8()?)?;
            let capacity = r.get_u64()?;

            let dim_num = r.get_u32()? as usize;
            let mut dimensions = Vec::with_capacity(dim_num);
            for _ in 0..dim_num {
                let name = r.get_str()?;
                let datatype = Datatype::from_u8(r.get_u8()?)?;
                let cell = datatype.size() as usize;
                let lo = r.get_bytes(cell)?.to_vec();
                let hi = r.get_bytes(cell)?.to_vec();
                let extent = r.get_bytes(cell)?.to_vec();
                dimensions.push(Dimension::new(&name, datatype, &lo, &hi, &extent)?);
            }

            let attr_num = r.get_u32()? as usize;
            let mut attributes = Vec::with_capacity(attr_num);
            for _ in 0..attr_num {
                let name = r.get_str()?;
                let datatype = Datatype::from_u8(r.get_u8()?)?;
                let cell_val_num = r.get_u32()?;
                let mut attr = Attribute::with_cell_val_num(&name, datatype, cell_val_num)?;
                let filter_num = r.get_u16()? as usize;
                for _ in 0..filter_num {
                    let tag = r.get_u8()?;
                    let level = r.get_i32()?;
                    attr = attr.add_filter(Filter::from_parts(tag, level)?);
                }
                attributes.push(attr);
            }

            let schema = Self {
                array_type,
                cell_order,
                tile_order,
                capacity,
                key_value: header.flags() & FLAG_KEY_VALUE != 0,
                dimensions,
                attributes,
            };
            schema.check()?;
            Ok(schema)
        };

        parse(&mut r).wrap_err("deserializing array schema")
    }
}
