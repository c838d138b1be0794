//! Cell-layout arithmetic shared by the dense writer and reader: shapes,
//! strides, and (de)linearization in row- or column-major order. All math
//! is on region-relative coordinates, widened to u64.

use crate::array::Layout;

/// Per-dimension cell counts of an inclusive region.
pub fn region_shape(region: &[(i128, i128)]) -> Vec<u64> {
    region.iter().map(|&(lo, hi)| (hi - lo + 1) as u64).collect()
}

pub fn total_cells(shape: &[u64]) -> u64 {
    shape.iter().product()
}

/// Strides for linearizing coordinates of `shape` in `layout` order.
pub fn strides(shape: &[u64], layout: Layout) -> Vec<u64> {
    let n = shape.len();
    let mut out = vec![1u64; n];
    match layout {
        Layout::RowMajor => {
            for i in (0..n.saturating_sub(1)).rev() {
                out[i] = out[i + 1] * shape[i + 1];
            }
        }
        Layout::ColMajor => {
            for i in 1..n {
                out[i] = out[i - 1] * shape[i - 1];
            }
        }
    }
    out
}

pub fn linearize(coords: &[u64], strides: &[u64]) -> u64 {
    coords.iter().zip(strides).map(|(c, s)| c * s).sum()
}

/// Inverse of [`linearize`] for the given shape and layout: walking
/// `index` from 0 to `total_cells - 1` visits the shape in that layout's
/// order.
pub fn delinearize(mut index: u64, shape: &[u64], layout: Layout) -> Vec<u64> {
    let s = strides(shape, layout);
    let mut coords = vec![0u64; shape.len()];
    let order: Vec<usize> = match layout {
        Layout::RowMajor => (0..shape.len()).collect(),
        Layout::ColMajor => (0..shape.len()).rev().collect(),
    };
    for i in order {
        coords[i] = index / s[i];
        index %= s[i];
    }
    coords
}
