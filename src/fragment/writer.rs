//! # Dense Fragment Writer
//!
//! Materializes one write into a new immutable fragment: a directory named
//! for its timestamp range, one tile file per attribute, and the metadata
//! file indexing them. The written subarray must be tile-aligned, meaning every
//! tile it touches is covered entirely, so a fragment's tile grid is
//! exactly the tile grid of its non-empty domain and the reader can
//! reconstruct cell positions from the metadata alone.
//!
//! Input cell buffers arrive in the schema's cell order over the
//! subarray; the writer regroups them into tiles (tile order across
//! tiles, cell order within each tile) as it appends to the attribute
//! files.

use eyre::{Result, WrapErr};
use smallvec::SmallVec;
use tracing::debug;

use super::layout::{delinearize, linearize, region_shape, strides, total_cells};
use super::metadata::{AttributeTileIndex, FragmentMetadata};
use super::FragmentUri;
use crate::array::ArraySchema;
use crate::crypto::EncryptionKey;
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::Vfs;

/// Stateless dense-write kernel.
pub struct DenseWriter;

impl DenseWriter {
    /// Writes `data` (one `(attribute, cells)` buffer per schema
    /// attribute, cells in cell order over `subarray`) as a new fragment
    /// of `array_uri`, stamped with `timestamp`. Returns the stored
    /// metadata.
    pub fn write(
        vfs: &Vfs,
        array_uri: &Uri,
        schema: &ArraySchema,
        key: &EncryptionKey,
        subarray: &[(i128, i128)],
        data: &[(String, Vec<u8>)],
        timestamp: u64,
    ) -> Result<FragmentMetadata> {
        if !schema.is_dense() {
            eyre::bail!(StorageError::InvalidArgument(
                "dense writer requires a dense array".into()
            ));
        }
        check_tile_aligned(schema, subarray)?;

        let shape = region_shape(subarray);
        let cell_count = total_cells(&shape);
        let tile_shape: Vec<u64> = tile_shape(schema)?;
        let tile_grid: Vec<u64> = shape
            .iter()
            .zip(&tile_shape)
            .map(|(s, e)| s / e)
            .collect();
        let tile_count = total_cells(&tile_grid);
        let cells_per_tile = total_cells(&tile_shape);

        let fragment = FragmentUri::generate(array_uri, timestamp, timestamp);
        vfs.create_dir(fragment.uri())
            .wrap_err_with(|| format!("creating fragment directory '{}'", fragment.name()))?;

        let coords = schema.coords_type();
        let non_empty_domain = subarray
            .iter()
            .map(|&(lo, hi)| Ok((coords.cell_from_i128(lo)?, coords.cell_from_i128(hi)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut meta = FragmentMetadata::new(
            fragment.clone(),
            true,
            non_empty_domain,
            cell_count,
            tile_count,
        );

        let src_strides = strides(&shape, schema.cell_order());
        let in_tile_strides = strides(&tile_shape, schema.cell_order());

        for attr in schema.attributes() {
            let Some(cell_size) = attr.cell_size() else {
                eyre::bail!(StorageError::InvalidArgument(format!(
                    "attribute '{}' is variable-length; the dense kernel writes fixed-size cells",
                    attr.name()
                )));
            };
            let Some((_, buffer)) = data.iter().find(|(name, _)| name.as_str() == attr.name()) else {
                eyre::bail!(StorageError::InvalidArgument(format!(
                    "write is missing a buffer for attribute '{}'",
                    attr.name()
                )));
            };
            if buffer.len() as u64 != cell_count * cell_size {
                eyre::bail!(StorageError::InvalidArgument(format!(
                    "attribute '{}': buffer holds {} bytes, subarray needs {}",
                    attr.name(),
                    buffer.len(),
                    cell_count * cell_size
                )));
            }

            let file_uri = meta.attribute_file_uri(attr.name());
            let mut offsets = Vec::with_capacity(tile_count as usize);
            let mut sizes = Vec::with_capacity(tile_count as usize);
            let mut written = 0u64;
            let mut tile_bytes = vec![0u8; (cells_per_tile * cell_size) as usize];
            let mut global: SmallVec<[u64; 4]> = SmallVec::new();

            for tile_idx in 0..tile_count {
                let tile_coords = delinearize(tile_idx, &tile_grid, schema.tile_order());
                for cell_idx in 0..cells_per_tile {
                    let cell_coords = delinearize(cell_idx, &tile_shape, schema.cell_order());
                    global.clear();
                    global.extend(
                        tile_coords
                            .iter()
                            .zip(&cell_coords)
                            .zip(&tile_shape)
                            .map(|((t, c), e)| t * e + c),
                    );
                    let src = linearize(&global, &src_strides) * cell_size;
                    let dst = linearize(&cell_coords, &in_tile_strides) * cell_size;
                    tile_bytes[dst as usize..(dst + cell_size) as usize]
                        .copy_from_slice(&buffer[src as usize..(src + cell_size) as usize]);
                }
                vfs.write(&file_uri, &tile_bytes)?;
                offsets.push(written);
                sizes.push(tile_bytes.len() as u64);
                written += tile_bytes.len() as u64;
            }

            vfs.sync(&file_uri)?;
            meta.push_attribute_tiles(AttributeTileIndex {
                attribute: attr.name().to_string(),
                offsets,
                sizes,
            });
        }

        meta.store(vfs, key)
            .wrap_err_with(|| format!("storing metadata for fragment '{}'", fragment.name()))?;
        debug!(
            fragment = fragment.name(),
            cells = cell_count,
            tiles = tile_count,
            "wrote dense fragment"
        );
        Ok(meta)
    }
}

pub(super) fn tile_shape(schema: &ArraySchema) -> Result<Vec<u64>> {
    schema
        .dimensions()
        .iter()
        .map(|d| Ok(d.integer_extent()? as u64))
        .collect()
}

/// The written region must sit inside the domain and start/end on tile
/// boundaries.
fn check_tile_aligned(schema: &ArraySchema, subarray: &[(i128, i128)]) -> Result<()> {
    if subarray.len() != schema.dim_num() {
        eyre::bail!(StorageError::InvalidArgument(format!(
            "subarray has {} dimensions, schema has {}",
            subarray.len(),
            schema.dim_num()
        )));
    }
    for (dim, &(lo, hi)) in schema.dimensions().iter().zip(subarray) {
        let (d_lo, d_hi) = dim.integer_domain()?;
        let extent = dim.integer_extent()?;
        if lo > hi || lo < d_lo || hi > d_hi {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "subarray [{lo}, {hi}] outside domain [{d_lo}, {d_hi}] on dimension '{}'",
                dim.name()
            )));
        }
        if (lo - d_lo) % extent != 0 || (hi - d_lo + 1) % extent != 0 {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "subarray [{lo}, {hi}] is not tile-aligned on dimension '{}' (extent {extent})",
                dim.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, ArrayType, Datatype, Dimension, Layout};
    use crate::config::Config;

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

    fn setup() -> (tempfile::TempDir, Uri, Vfs) {
        let dir = tempfile::tempdir().unwrap();
        let array_uri = Uri::from(dir.path()).join("a1");
        let vfs = Vfs::new(&Config::new());
        vfs.create_dir(&array_uri).unwrap();
        (dir, array_uri, vfs)
    }

    #[test]
    fn writes_fragment_with_tile_regrouping() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        // Full 4x4 domain in row-major order: value = 10*row + col.
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
            42,
        )
        .unwrap();

        assert_eq!(meta.tile_num(), 4);
        assert_eq!(meta.cell_num(), 16);
        assert_eq!(meta.fragment().t_first(), 42);

        // First tile (rows 1-2, cols 1-2) in cell order:
        let file = meta.attribute_file_uri("a");
        let mut buf = Vec::new();
        vfs.read(&file, 0, &mut buf, 16).unwrap();
        let tile0: Vec<i32> = buf
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(tile0, vec![11, 12, 21, 22]);

        // Metadata round-trips through the VFS.
        let loaded = FragmentMetadata::load(
            &vfs,
            meta.fragment(),
            &schema,
            &EncryptionKey::Unencrypted,
        )
        .unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn partial_tile_aligned_write() {
        let (_dir, array_uri, vfs) = setup();
        let schema = schema_2x2_tiles();

        // One tile: rows 3-4, cols 1-2.
        let meta = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema,
            &EncryptionKey::Unencrypted,
            &[(3, 4), (1, 2)],
            &[("a".into(), cells(&[1, 2, 3, 4]))],
            7,
        )
        .unwrap();
        assert_eq!(meta.tile_num(), 1);
        assert_eq!(meta.cell_num(), 4);
    }

    #[test]
    fn unaligned_subarray_rejected() {
        let (_dir, array_uri, vfs) = setup();
        let err = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema_2x2_tiles(),
            &EncryptionKey::Unencrypted,
            &[(2, 3), (1, 2)],
            &[("a".into(), cells(&[1, 2, 3, 4]))],
            7,
        )
        .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidArgument(String::new())
        ));
    }

    #[test]
    fn missing_attribute_buffer_rejected() {
        let (_dir, array_uri, vfs) = setup();
        let err = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema_2x2_tiles(),
            &EncryptionKey::Unencrypted,
            &[(1, 2), (1, 2)],
            &[],
            7,
        )
        .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidArgument(String::new())
        ));
    }

    #[test]
    fn short_buffer_rejected() {
        let (_dir, array_uri, vfs) = setup();
        let err = DenseWriter::write(
            &vfs,
            &array_uri,
            &schema_2x2_tiles(),
            &EncryptionKey::Unencrypted,
            &[(1, 2), (1, 2)],
            &[("a".into(), cells(&[1, 2]))],
            7,
        )
        .unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidArgument(String::new())
        ));
    }
}
