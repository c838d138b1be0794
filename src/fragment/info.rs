//! # Fragment Info
//!
//! A lightweight, caller-facing summary of one fragment, derived from its
//! loaded metadata. The consolidator plans its steps over these (fragment
//! count, sizes, timestamp ranges) without holding the full tile indexes.

use super::metadata::FragmentMetadata;
use crate::uri::Uri;

/// Summary of one fragment, ordered like its URI: `(t_first, uuid)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentInfo {
    pub uri: Uri,
    pub version: u32,
    pub timestamp_range: (u64, u64),
    pub dense: bool,
    pub cell_num: u64,
    pub fragment_size: u64,
    /// Inclusive raw-cell bounds per dimension.
    pub non_empty_domain: Vec<(Vec<u8>, Vec<u8>)>,
}

impl FragmentInfo {
    pub fn from_metadata(meta: &FragmentMetadata) -> Self {
        Self {
            uri: meta.fragment().uri().clone(),
            version: meta.fragment().version(),
            timestamp_range: (meta.fragment().t_first(), meta.fragment().t_last()),
            dense: meta.is_dense(),
            cell_num: meta.cell_num(),
            fragment_size: meta.fragment_size(),
            non_empty_domain: meta.non_empty_domain().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::metadata::AttributeTileIndex;
    use crate::fragment::FragmentUri;

    #[test]
    fn summarizes_metadata() {
        let frag = FragmentUri::generate(&Uri::new("/arrays/a1"), 3, 5);
        let mut meta = FragmentMetadata::new(
            frag.clone(),
            true,
            vec![(vec![1, 0, 0, 0], vec![4, 0, 0, 0])],
            4,
            2,
        );
        meta.push_attribute_tiles(AttributeTileIndex {
            attribute: "a".into(),
            offsets: vec![0, 8],
            sizes: vec![8, 8],
        });

        let info = FragmentInfo::from_metadata(&meta);
        assert_eq!(info.timestamp_range, (3, 5));
        assert_eq!(info.fragment_size, 16);
        assert_eq!(info.cell_num, 4);
        assert!(info.dense);
        assert_eq!(info.uri, frag.uri().clone());
    }
}
