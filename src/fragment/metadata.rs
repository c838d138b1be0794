//! # Fragment Metadata
//!
//! The per-fragment index: timestamp range, non-empty domain, per-attribute
//! tile offsets and sizes, and, for sparse fragments, per-tile MBRs.
//! Loaded lazily by the storage manager, validated against the array
//! schema, then shared immutably behind an `Arc` by every reader of the
//! owning open-array entry.
//!
//! ## File Format
//!
//! `__fragment_metadata.tsr` is a 64-byte zerocopy header followed by a
//! little-endian body:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "TesseraFragMeta\0"
//! 16      4     Format version (u32)
//! 20      4     Flags (bit 0: dense)
//! 24      32    Encryption key digest (zero when unencrypted)
//! 56      8     Body length (u64)
//! 64      ...   Body: timestamps, cell/tile counts, domain, tile index, MBRs
//! ```

use eyre::{Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::FragmentUri;
use crate::array::ArraySchema;
use crate::config::{
    FILE_HEADER_SIZE, FORMAT_VERSION, FRAGMENT_METADATA_FILENAME, FILE_SUFFIX,
    MIN_SUPPORTED_FORMAT_VERSION,
};
use crate::crypto::{EncryptionKey, KEY_DIGEST_LEN};
use crate::encoding::{ByteReader, ByteWriter};
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::Vfs;
use crate::zerocopy_getters;

pub const FRAGMENT_METADATA_MAGIC: &[u8; 16] = b"TesseraFragMeta\0";

const FLAG_DENSE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FragmentMetadataHeader {
    magic: [u8; 16],
    version: U32,
    flags: U32,
    key_digest: [u8; KEY_DIGEST_LEN],
    body_len: U64,
}

const _: () = assert!(std::mem::size_of::<FragmentMetadataHeader>() == FILE_HEADER_SIZE);

impl FragmentMetadataHeader {
    zerocopy_getters! {
        version: u32,
        flags: u32,
        body_len: u64,
    }
}

/// Tile offsets and sizes for one attribute file, indexed by tile
/// position in tile order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTileIndex {
    pub attribute: String,
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
}

/// Immutable per-fragment index.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentMetadata {
    fragment: FragmentUri,
    dense: bool,
    /// Inclusive raw-cell bounds per dimension.
    non_empty_domain: Vec<(Vec<u8>, Vec<u8>)>,
    cell_num: u64,
    tile_num: u64,
    attribute_tiles: Vec<AttributeTileIndex>,
    /// Sparse only: per-tile minimum bounding rectangles, one raw-cell
    /// bound pair per dimension.
    mbrs: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl FragmentMetadata {
    pub fn new(
        fragment: FragmentUri,
        dense: bool,
        non_empty_domain: Vec<(Vec<u8>, Vec<u8>)>,
        cell_num: u64,
        tile_num: u64,
    ) -> Self {
        Self {
            fragment,
            dense,
            non_empty_domain,
            cell_num,
            tile_num,
            attribute_tiles: Vec::new(),
            mbrs: Vec::new(),
        }
    }

    pub fn push_attribute_tiles(&mut self, index: AttributeTileIndex) {
        debug_assert_eq!(index.offsets.len(), index.sizes.len());
        self.attribute_tiles.push(index);
    }

    pub fn push_mbr(&mut self, mbr: Vec<(Vec<u8>, Vec<u8>)>) {
        self.mbrs.push(mbr);
    }

    pub fn fragment(&self) -> &FragmentUri {
        &self.fragment
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn non_empty_domain(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.non_empty_domain
    }

    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_num
    }

    pub fn mbrs(&self) -> &[Vec<(Vec<u8>, Vec<u8>)>] {
        &self.mbrs
    }

    pub fn tile_index(&self, attribute: &str) -> Option<&AttributeTileIndex> {
        self.attribute_tiles.iter().find(|t| t.attribute == attribute)
    }

    pub fn attribute_tiles(&self) -> &[AttributeTileIndex] {
        &self.attribute_tiles
    }

    /// URI of the tile file backing `attribute` in this fragment.
    pub fn attribute_file_uri(&self, attribute: &str) -> Uri {
        self.fragment
            .uri()
            .join(&format!("{attribute}{FILE_SUFFIX}"))
    }

    /// Total bytes of attribute tile data.
    pub fn fragment_size(&self) -> u64 {
        self.attribute_tiles
            .iter()
            .flat_map(|t| t.sizes.iter())
            .sum()
    }

    /// Checks this metadata against the array schema it claims to index.
    pub fn validate(&self, schema: &ArraySchema) -> Result<()> {
        let what = self.fragment.name().to_string();
        if self.non_empty_domain.len() != schema.dim_num() {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{what}': non-empty domain has {} dimensions, schema has {}",
                self.non_empty_domain.len(),
                schema.dim_num()
            )));
        }
        let cell = schema.coords_type().size() as usize;
        for (lo, hi) in &self.non_empty_domain {
            if lo.len() != cell || hi.len() != cell {
                eyre::bail!(StorageError::InvalidFragment(format!(
                    "'{what}': domain bound width mismatches coordinate datatype"
                )));
            }
        }
        for index in &self.attribute_tiles {
            if schema.attribute(&index.attribute).is_none() {
                eyre::bail!(StorageError::InvalidFragment(format!(
                    "'{what}': unknown attribute '{}'",
                    index.attribute
                )));
            }
            if index.offsets.len() != index.sizes.len()
                || index.offsets.len() as u64 != self.tile_num
            {
                eyre::bail!(StorageError::InvalidFragment(format!(
                    "'{what}': tile index for '{}' mismatches tile count {}",
                    index.attribute, self.tile_num
                )));
            }
        }
        if self.dense && !self.mbrs.is_empty() {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{what}': dense fragment carries MBRs"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn metadata_uri(&self) -> Uri {
        self.fragment.uri().join(FRAGMENT_METADATA_FILENAME)
    }

    pub fn serialize(&self, key: &EncryptionKey) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.fragment.t_first());
        w.put_u64(self.fragment.t_last());
        w.put_u64(self.cell_num);
        w.put_u64(self.tile_num);

        w.put_u32(self.non_empty_domain.len() as u32);
        for (lo, hi) in &self.non_empty_domain {
            w.put_blob(lo);
            w.put_blob(hi);
        }

        w.put_u32(self.attribute_tiles.len() as u32);
        for index in &self.attribute_tiles {
            w.put_str(&index.attribute);
            w.put_u32(index.offsets.len() as u32);
            for (&off, &size) in index.offsets.iter().zip(&index.sizes) {
                w.put_u64(off);
                w.put_u64(size);
            }
        }

        w.put_u32(self.mbrs.len() as u32);
        for mbr in &self.mbrs {
            w.put_u32(mbr.len() as u32);
            for (lo, hi) in mbr {
                w.put_blob(lo);
                w.put_blob(hi);
            }
        }

        let body = w.into_bytes();
        let flags = if self.dense { FLAG_DENSE } else { 0 };
        let header = FragmentMetadataHeader {
            magic: *FRAGMENT_METADATA_MAGIC,
            version: U32::new(FORMAT_VERSION),
            flags: U32::new(flags),
            key_digest: key.digest(),
            body_len: U64::new(body.len() as u64),
        };

        let mut out = Vec::with_capacity(FILE_HEADER_SIZE + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn deserialize(bytes: &[u8], fragment: &FragmentUri, key: &EncryptionKey) -> Result<Self> {
        let name = fragment.name().to_string();
        if bytes.len() < FILE_HEADER_SIZE {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}': metadata file shorter than its header"
            )));
        }
        let header = FragmentMetadataHeader::ref_from_bytes(&bytes[..FILE_HEADER_SIZE]).map_err(
            |e| eyre::eyre!(StorageError::InvalidFragment(format!("'{name}': {e:?}"))),
        )?;
        if &header.magic != FRAGMENT_METADATA_MAGIC {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}': bad magic bytes in metadata file"
            )));
        }
        let version = header.version();
        if !(MIN_SUPPORTED_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            eyre::bail!(StorageError::UnsupportedVersion(format!(
                "'{name}': metadata format version {version}"
            )));
        }
        key.check_digest(&header.key_digest, "fragment metadata")?;

        let body_len = header.body_len() as usize;
        if bytes.len() < FILE_HEADER_SIZE + body_len {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}': metadata file truncated"
            )));
        }
        let dense = header.flags() & FLAG_DENSE != 0;

        let mut r = ByteReader::new(&bytes[FILE_HEADER_SIZE..FILE_HEADER_SIZE + body_len]);
        let parse = |r: &mut ByteReader<'_>| -> Result<Self> {
            let t_first = r.get_u64()?;
            let t_last = r.get_u64()?;
            if (t_first, t_last) != (fragment.t_first(), fragment.t_last()) {
                eyre::bail!(StorageError::InvalidFragment(format!(
                    "'{name}': metadata timestamps [{t_first}, {t_last}] disagree with name"
                )));
            }
            let cell_num = r.get_u64()?;
            let tile_num = r.get_u64()?;

            let dim_num = r.get_u32()? as usize;
            let mut non_empty_domain = Vec::with_capacity(dim_num);
            for _ in 0..dim_num {
                non_empty_domain.push((r.get_blob()?, r.get_blob()?));
            }

            let mut meta = Self::new(fragment.clone(), dense, non_empty_domain, cell_num, tile_num);

            let attr_num = r.get_u32()? as usize;
            for _ in 0..attr_num {
                let attribute = r.get_str()?;
                let n = r.get_u32()? as usize;
                let mut offsets = Vec::with_capacity(n);
                let mut sizes = Vec::with_capacity(n);
                for _ in 0..n {
                    offsets.push(r.get_u64()?);
                    sizes.push(r.get_u64()?);
                }
                meta.push_attribute_tiles(AttributeTileIndex {
                    attribute,
                    offsets,
                    sizes,
                });
            }

            let mbr_num = r.get_u32()? as usize;
            for _ in 0..mbr_num {
                let pairs = r.get_u32()? as usize;
                let mut mbr = Vec::with_capacity(pairs);
                for _ in 0..pairs {
                    mbr.push((r.get_blob()?, r.get_blob()?));
                }
                meta.push_mbr(mbr);
            }
            Ok(meta)
        };

        parse(&mut r).wrap_err_with(|| format!("deserializing fragment metadata '{name}'"))
    }

    /// Writes the metadata file into the fragment directory and syncs it.
    pub fn store(&self, vfs: &Vfs, key: &EncryptionKey) -> Result<()> {
        let uri = self.metadata_uri();
        vfs.write(&uri, &self.serialize(key))?;
        vfs.sync(&uri)?;
        Ok(())
    }

    /// Loads and validates the metadata of `fragment`.
    pub fn load(
        vfs: &Vfs,
        fragment: &FragmentUri,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<Self> {
        let uri = fragment.uri().join(FRAGMENT_METADATA_FILENAME);
        if !vfs.is_file(&uri)? {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{}': missing metadata file",
                fragment.name()
            )));
        }
        let size = vfs.file_size(&uri)?;
        let mut bytes = Vec::new();
        vfs.read(&uri, 0, &mut bytes, size)?;

        let meta = Self::deserialize(&bytes, fragment, key)?;
        meta.validate(schema)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, ArrayType, Datatype, Dimension, Layout};

    fn schema() -> ArraySchema {
        ArraySchema::new(
            ArrayType::Dense,
            Layout::RowMajor,
            Layout::RowMajor,
            16,
            vec![
                Dimension::with_integer_domain("d1", Datatype::Int64, 1, 4, 2).unwrap(),
                Dimension::with_integer_domain("d2", Datatype::Int64, 1, 4, 2).unwrap(),
            ],
            vec![Attribute::new("a", Datatype::Int32).unwrap()],
        )
        .unwrap()
    }

    fn domain() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (1i64.to_le_bytes().to_vec(), 4i64.to_le_bytes().to_vec()),
            (1i64.to_le_bytes().to_vec(), 4i64.to_le_bytes().to_vec()),
        ]
    }

    fn sample_metadata() -> FragmentMetadata {
        let frag = FragmentUri::generate(&Uri::new("/arrays/a1"), 10, 10);
        let mut meta = FragmentMetadata::new(frag, true, domain(), 16, 4);
        meta.push_attribute_tiles(AttributeTileIndex {
            attribute: "a".into(),
            offsets: vec![0, 16, 32, 48],
            sizes: vec![16, 16, 16, 16],
        });
        meta
    }

    #[test]
    fn serialize_round_trip() {
        let meta = sample_metadata();
        let bytes = meta.serialize(&EncryptionKey::Unencrypted);
        let restored =
            FragmentMetadata::deserialize(&bytes, meta.fragment(), &EncryptionKey::Unencrypted)
                .unwrap();
        assert_eq!(restored, meta);
        assert_eq!(restored.fragment_size(), 64);
    }

    #[test]
    fn wrong_key_is_mismatch() {
        let meta = sample_metadata();
        let key = EncryptionKey::aes_256_gcm(&[1u8; 32]).unwrap();
        let bytes = meta.serialize(&key);
        let err = FragmentMetadata::deserialize(&bytes, meta.fragment(), &EncryptionKey::Unencrypted)
            .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::EncryptionMismatch(String::new())
        ));
    }

    #[test]
    fn timestamp_disagreement_rejected() {
        let meta = sample_metadata();
        let bytes = meta.serialize(&EncryptionKey::Unencrypted);
        let other = FragmentUri::generate(&Uri::new("/arrays/a1"), 99, 99);
        let err =
            FragmentMetadata::deserialize(&bytes, &other, &EncryptionKey::Unencrypted).unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidFragment(String::new())
        ));
    }

    #[test]
    fn validate_against_schema() {
        let meta = sample_metadata();
        meta.validate(&schema()).unwrap();
    }

    #[test]
    fn unknown_attribute_rejected() {
        let mut meta = sample_metadata();
        meta.push_attribute_tiles(AttributeTileIndex {
            attribute: "ghost".into(),
            offsets: vec![0, 0, 0, 0],
            sizes: vec![0, 0, 0, 0],
        });
        let err = meta.validate(&schema()).unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidFragment(String::new())
        ));
    }

    #[test]
    fn dense_with_mbrs_rejected() {
        let mut meta = sample_metadata();
        meta.push_mbr(domain());
        assert!(meta.validate(&schema()).is_err());
    }

    #[test]
    fn store_and_load_through_vfs() {
        let dir = tempfile::tempdir().unwrap();
        let array_uri = Uri::from(dir.path()).join("a1");
        let vfs = Vfs::new(&crate::config::Config::new());
        vfs.create_dir(&array_uri).unwrap();

        let frag = FragmentUri::generate(&array_uri, 7, 7);
        vfs.create_dir(frag.uri()).unwrap();

        let mut meta = FragmentMetadata::new(frag.clone(), true, domain(), 16, 4);
        meta.push_attribute_tiles(AttributeTileIndex {
            attribute: "a".into(),
            offsets: vec![0, 16, 32, 48],
            sizes: vec![16, 16, 16, 16],
        });
        meta.store(&vfs, &EncryptionKey::Unencrypted).unwrap();

        let loaded =
            FragmentMetadata::load(&vfs, &frag, &schema(), &EncryptionKey::Unencrypted).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn missing_metadata_file_is_invalid_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let array_uri = Uri::from(dir.path()).join("a1");
        let vfs = Vfs::new(&crate::config::Config::new());
        vfs.create_dir(&array_uri).unwrap();

        let frag = FragmentUri::generate(&array_uri, 7, 7);
        vfs.create_dir(frag.uri()).unwrap();

        let err = FragmentMetadata::load(&vfs, &frag, &schema(), &EncryptionKey::Unencrypted)
            .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidFragment(String::new())
        ));
    }
}
