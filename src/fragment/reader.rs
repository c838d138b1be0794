//! # Dense Subarray Reader
//!
//! Materializes a subarray by overlaying fragment snapshots in apparent
//! write order: fragments arrive sorted `(t_first, uuid)` ascending, and
//! each later fragment's cells overwrite earlier ones where they overlap.
//! Cells covered by no fragment read as zero-filled.
//!
//! Tile bytes are pulled through a [`TileSource`]; the storage manager
//! implements it with its cache-then-VFS passthrough, so hot tiles are
//! served from the tile cache without the kernel knowing.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use smallvec::SmallVec;

use super::layout::{linearize, region_shape, strides, total_cells};
use super::metadata::FragmentMetadata;
use super::writer::tile_shape;
use crate::array::{ArraySchema, Layout};
use crate::error::StorageError;
use crate::uri::Uri;

/// Provider of raw tile bytes, keyed by `(file uri, offset, size)`.
pub trait TileSource: Send + Sync {
    fn fetch_tile(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Vec<u8>>;
}

/// Stateless dense-read kernel.
pub struct DenseReader;

impl DenseReader {
    /// Reads `attribute` over `subarray`, returning cells in `layout`
    /// order. `fragments` must be the snapshot's metadata list in
    /// apparent write order.
    pub fn read(
        source: &dyn TileSource,
        schema: &ArraySchema,
        fragments: &[Arc<FragmentMetadata>],
        subarray: &[(i128, i128)],
        attribute: &str,
        layout: Layout,
    ) -> Result<Vec<u8>> {
        if !schema.is_dense() {
            eyre::bail!(StorageError::InvalidArgument(
                "dense reader requires a dense array".into()
            ));
        }
        let Some(attr) = schema.attribute(attribute) else {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "unknown attribute '{attribute}'"
            )));
        };
        let Some(cell_size) = attr.cell_size() else {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "attribute '{attribute}' is variable-length; the dense kernel reads fixed-size cells"
            )));
        };
        check_in_domain(schema, subarray)?;

        let out_shape = region_shape(subarray);
        let out_strides = strides(&out_shape, layout);
        let mut out = vec![0u8; (total_cells(&out_shape) * cell_size) as usize];

        let tile_shape = tile_shape(schema)?;
        let coords = schema.coords_type();

        for meta in fragments {
            if !meta.is_dense() {
                eyre::bail!(StorageError::InvalidArgument(format!(
                    "fragment '{}' is sparse; the dense kernel cannot overlay it",
                    meta.fragment().name()
                )));
            }
            let Some(index) = meta.tile_index(attribute) else {
                eyre::bail!(StorageError::InvalidFragment(format!(
                    "fragment '{}' has no tile index for attribute '{attribute}'",
                    meta.fragment().name()
                )));
            };

            // Fragment bounds and the overlap with the requested region.
            let mut frag_region: SmallVec<[(i128, i128); 4]> = SmallVec::new();
            for (lo, hi) in meta.non_empty_domain() {
                frag_region.push((coords.cell_to_i128(lo)?, coords.cell_to_i128(hi)?));
            }
            let mut overlap: SmallVec<[(i128, i128); 4]> = SmallVec::new();
            let mut empty = false;
            for (&(f_lo, f_hi), &(s_lo, s_hi)) in frag_region.iter().zip(subarray) {
                let lo = f_lo.max(s_lo);
                let hi = f_hi.min(s_hi);
                if lo > hi {
                    empty = true;
                    break;
                }
                overlap.push((lo, hi));
            }
            if empty {
                continue;
            }

            let frag_shape = region_shape(&frag_region);
            let frag_tile_grid: Vec<u64> = frag_shape
                .iter()
                .zip(&tile_shape)
                .map(|(s, e)| s.div_ceil(*e))
                .collect();
            let tile_grid_strides = strides(&frag_tile_grid, schema.tile_order());
            let in_tile_strides = strides(&tile_shape, schema.cell_order());
            let file_uri = meta.attribute_file_uri(attribute);

            let overlap_shape = region_shape(&overlap);
            let mut fetched: HashMap<u64, Vec<u8>> = HashMap::new();
            let mut tile_coords: SmallVec<[u64; 4]> = SmallVec::new();
            let mut cell_coords: SmallVec<[u64; 4]> = SmallVec::new();
            let mut out_coords: SmallVec<[u64; 4]> = SmallVec::new();

            for cell_idx in 0..total_cells(&overlap_shape) {
                let rel = super::layout::delinearize(cell_idx, &overlap_shape, Layout::RowMajor);

                tile_coords.clear();
                cell_coords.clear();
                out_coords.clear();
                for (((r, &(o_lo, _)), &(f_lo, _)), (&(s_lo, _), &e)) in rel
                    .iter()
                    .zip(overlap.iter())
                    .zip(frag_region.iter())
                    .zip(subarray.iter().zip(tile_shape.iter()))
                {
                    let global = o_lo + *r as i128;
                    let frag_rel = (global - f_lo) as u64;
                    tile_coords.push(frag_rel / e);
                    cell_coords.push(frag_rel % e);
                    out_coords.push((global - s_lo) as u64);
                }

                let tile_idx = linearize(&tile_coords, &tile_grid_strides);
                if tile_idx as usize >= index.offsets.len() {
                    eyre::bail!(StorageError::InvalidFragment(format!(
                        "fragment '{}': tile {tile_idx} beyond its index",
                        meta.fragment().name()
                    )));
                }
                if !fetched.contains_key(&tile_idx) {
                    let offset = index.offsets[tile_idx as usize];
                    let size = index.sizes[tile_idx as usize];
                    let bytes = source.fetch_tile(&file_uri, offset, size)?;
                    fetched.insert(tile_idx, bytes);
                }
                let tile = fetched.get(&tile_idx).expect("tile fetched above");

                let src = (linearize(&cell_coords, &in_tile_strides) * cell_size) as usize;
                let dst = (linearize(&out_coords, &out_strides) * cell_size) as usize;
                out[dst..dst + cell_size as usize]
                    .copy_from_slice(&tile[src..src + cell_size as usize]);
            }
        }

        Ok(out)
    }
}

fn check_in_domain(schema: &ArraySchema, subarray: &[(i128, i128)]) -> Result<()> {
    if subarray.len() != schema.dim_num() {
        eyre::bail!(StorageError::InvalidArgument(format!(
            "subarray has {} dimensions, schema has {}",
            subarray.len(),
            schema.dim_num()
        )));
    }
    for (dim, &(lo, hi)) in schema.dimensions().iter().zip(subarray) {
        let (d_lo, d_hi) = dim.integer_domain()?;
        if lo > hi || lo < d_lo || hi > d_hi {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "subarray [{lo}, {hi}] outside domain [{d_lo}, {d_hi}] on dimension '{}'",
                dim.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::writer::DenseWriter;
    use crate::array::{Attribute, ArrayType, Datatype, Dimension};
    use crate::config::Config;
    use crate::crypto::EncryptionKey;
    use crate::vfs::Vfs;

    /// Straight-to-VFS tile source for kernel tests.
    struct VfsSource(Vfs);

    impl TileSource for VfsSource {
        fn fetch_tile(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            self.0.read(uri, offset, &mut buf, nbytes)?;
            Ok(buf)
        }
    }

    fn schema_2x2_tiles() -> ArraySchema {
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

    fn cells(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn setup() -> (tempfile::TempDir, Uri, Vfs) {
        let dir = tempfile::tempdir().unwrap();
        let array_uri = Uri::from(dir.path()).join("a1");
        let vfs = Vfs::new(&Config::new());
        vfs.create_dir(&array_uri).unwrap();
        (dir, array_uri, vfs)
    }

    #[test]
    fn write_then_read_full_domain() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        let values: Vec<i32> = (0..16).collect();
        let meta = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(1, 4), (1, 4)],
            &[("a".into(), cells(&values))],
            1,
        )
        .unwrap();

        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[Arc::new(meta)],
            &[(1, 4), (1, 4)],
            "a",
            Layout::RowMajor,
        )
        .unwrap();
        assert_eq!(decode(&out), values);
    }

    #[test]
    fn read_subregion_crossing_tiles() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        let values: Vec<i32> = (1..=4)
            .flat_map(|r| (1..=4).map(move |c| 10 * r + c))
            .collect();
        let meta = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(1, 4), (1, 4)],
            &[("a".into(), cells(&values))],
            1,
        )
        .unwrap();

        // Center 2x2 block straddles all four tiles.
        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[Arc::new(meta)],
            &[(2, 3), (2, 3)],
            "a",
            Layout::RowMajor,
        )
        .unwrap();
        assert_eq!(decode(&out), vec![22, 23, 32, 33]);
    }

    #[test]
    fn later_fragment_overlays_earlier() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        let base = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(1, 4), (1, 4)],
            &[("a".into(), cells(&[0; 16]))],
            1,
        )
        .unwrap();
        let patch = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(1, 2), (1, 2)],
            &[("a".into(), cells(&[7, 7, 7, 7]))],
            2,
        )
        .unwrap();

        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[Arc::new(base), Arc::new(patch)],
            &[(1, 4), (1, 4)],
            "a",
            Layout::RowMajor,
        )
        .unwrap();
        let vals = decode(&out);
        assert_eq!(vals[0], 7); // (1,1)
        assert_eq!(vals[1], 7); // (1,2)
        assert_eq!(vals[4], 7); // (2,1)
        assert_eq!(vals[5], 7); // (2,2)
        assert_eq!(vals[2], 0);
        assert_eq!(vals[15], 0);
    }

    #[test]
    fn uncovered_cells_read_as_fill() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        let meta = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(3, 4), (3, 4)],
            &[("a".into(), cells(&[5, 5, 5, 5]))],
            1,
        )
        .unwrap();

        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[Arc::new(meta)],
            &[(1, 4), (1, 4)],
            "a",
            Layout::RowMajor,
        )
        .unwrap();
        let vals = decode(&out);
        assert_eq!(vals[0], 0);
        assert_eq!(vals[15], 5);
    }

    #[test]
    fn column_major_result_layout() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        let values: Vec<i32> = (1..=4)
            .flat_map(|r| (1..=4).map(move |c| 10 * r + c))
            .collect();
        let meta = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(1, 4), (1, 4)],
            &[("a".into(), cells(&values))],
            1,
        )
        .unwrap();

        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[Arc::new(meta)],
            &[(1, 2), (1, 2)],
            "a",
            Layout::ColMajor,
        )
        .unwrap();
        assert_eq!(decode(&out), vec![11, 21, 12, 22]);
    }

    #[test]
    fn out_of_domain_subarray_rejected() {
        let schema = schema_2x2_tiles();
        let err = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[],
            &[(0, 5), (1, 4)],
            "a",
            Layout::RowMajor,
        )
        .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidArgument(String::new())
        ));
    }

    #[test]
    fn empty_snapshot_reads_fill_values() {
        let schema = schema_2x2_tiles();
        let out = DenseReader::read(
            &VfsSource(Vfs::new(&Config::new())),
            &schema,
            &[],
            &[(1, 4), (1, 4)],
            "a",
            Layout::RowMajor,
        )
        .unwrap();
        assert_eq!(decode(&out), vec![0; 16]);
    }
}
