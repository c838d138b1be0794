//! # Fragments
//!
//! A fragment is one atomically-written, immutable set of cells: the unit
//! of MVCC. Each write produces a new fragment directory under the array,
//! named with its timestamp range and a UUID:
//!
//! ```text
//! array_uri/
//! ├── __array_schema.tsr
//! ├── __lock.tsr
//! ├── __1577836800000_1577836800000_0a3f…-…_4/     # current naming
//! │   ├── __fragment_metadata.tsr
//! │   └── a.tsr                                    # one tile file per attribute
//! └── __9f2c…-…_1577836700000_1577836700000/       # legacy naming (v1-3)
//! ```
//!
//! Visibility at read timestamp `t` is `t_first ≤ t`; the apparent write
//! order is `(t_first ascending, uuid ascending)`. Two fragments can
//! share a `t_first`; the UUID breaks the tie totally.

pub mod info;
pub mod layout;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use info::FragmentInfo;
pub use metadata::{AttributeTileIndex, FragmentMetadata};
pub use reader::{DenseReader, TileSource};
pub use writer::DenseWriter;

use std::cmp::Ordering;

use eyre::Result;
use uuid::Uuid;

use crate::config::{
    FIRST_VERSIONED_NAME_FORMAT, FORMAT_VERSION, FRAGMENT_NAME_PREFIX,
    MIN_SUPPORTED_FORMAT_VERSION,
};
use crate::error::StorageError;
use crate::uri::Uri;

/// Current wall-clock time in milliseconds since the Unix epoch, the
/// MVCC timestamp domain.
pub fn wallclock_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A parsed fragment URI: directory URI plus the fields encoded in its
/// name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentUri {
    uri: Uri,
    t_first: u64,
    t_last: u64,
    uuid: String,
    version: u32,
}

impl FragmentUri {
    /// Parses a fragment directory URI. Accepts the current
    /// `__t_first_t_last_uuid_version` layout and the legacy
    /// `__uuid_t_first_t_last` layout (reported as version 3).
    pub fn parse(uri: &Uri) -> Result<Self> {
        let name = uri.last_path_part();
        let Some(body) = name.strip_prefix(FRAGMENT_NAME_PREFIX) else {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}' does not carry the fragment prefix"
            )));
        };

        let parts: Vec<&str> = body.split('_').collect();
        let (t_first, t_last, uuid, version) = match parts.as_slice() {
            [t1, t2, uuid, ver] => {
                let t_first = parse_ts(name, t1)?;
                let t_last = parse_ts(name, t2)?;
                let version: u32 = ver.parse().map_err(|_| bad_name(name))?;
                if version < FIRST_VERSIONED_NAME_FORMAT {
                    eyre::bail!(StorageError::InvalidFragment(format!(
                        "'{name}': version {version} cannot use the versioned name layout"
                    )));
                }
                (t_first, t_last, uuid.to_string(), version)
            }
            [uuid, t1, t2] => {
                let t_first = parse_ts(name, t1)?;
                let t_last = parse_ts(name, t2)?;
                (t_first, t_last, uuid.to_string(), FIRST_VERSIONED_NAME_FORMAT - 1)
            }
            _ => return Err(bad_name(name)),
        };

        if Uuid::parse_str(&uuid).is_err() {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}': malformed uuid '{uuid}'"
            )));
        }
        if t_first > t_last {
            eyre::bail!(StorageError::InvalidFragment(format!(
                "'{name}': timestamp range is inverted"
            )));
        }
        if version > FORMAT_VERSION || version < MIN_SUPPORTED_FORMAT_VERSION {
            eyre::bail!(StorageError::UnsupportedVersion(format!(
                "'{name}': fragment format version {version}"
            )));
        }

        Ok(Self {
            uri: uri.clone(),
            t_first,
            t_last,
            uuid,
            version,
        })
    }

    /// Allocates a fresh fragment URI under `array_uri` in the current
    /// naming layout.
    pub fn generate(array_uri: &Uri, t_first: u64, t_last: u64) -> Self {
        debug_assert!(t_first <= t_last);
        let uuid = Uuid::new_v4().to_string();
        let name = format!("{FRAGMENT_NAME_PREFIX}{t_first}_{t_last}_{uuid}_{FORMAT_VERSION}");
        Self {
            uri: array_uri.join(&name),
            t_first,
            t_last,
            uuid,
            version: FORMAT_VERSION,
        }
    }

    /// Quick syntactic probe used when enumerating array directories.
    pub fn is_fragment_name(name: &str) -> bool {
        let Some(body) = name.strip_prefix(FRAGMENT_NAME_PREFIX) else {
            return false;
        };
        if name.ends_with(".tsr") {
            return false;
        }
        matches!(body.split('_').count(), 3 | 4)
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn name(&self) -> &str {
        self.uri.last_path_part()
    }

    pub fn t_first(&self) -> u64 {
        self.t_first
    }

    pub fn t_last(&self) -> u64 {
        self.t_last
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl PartialOrd for FragmentUri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FragmentUri {
    /// Apparent write order: `(t_first, uuid)` ascending.
    fn cmp(&self, other: &Self) -> Ordering {
        self.t_first
            .cmp(&other.t_first)
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

fn parse_ts(name: &str, raw: &str) -> Result<u64> {
    raw.parse().map_err(|_| bad_name(name))
}

fn bad_name(name: &str) -> eyre::Report {
    eyre::eyre!(StorageError::InvalidFragment(format!(
        "cannot parse fragment name '{name}'"
    )))
}

/// Filters `children` down to fragment directories visible at `timestamp`
/// and returns them in apparent write order. Non-fragment names are
/// skipped silently (schema file, lock file, foreign files); names that
/// look like fragments but fail to parse are errors.
pub fn sorted_visible_fragments(children: &[Uri], timestamp: u64) -> Result<Vec<FragmentUri>> {
    let mut fragments = Vec::new();
    for child in children {
        if !FragmentUri::is_fragment_name(child.last_path_part()) {
            continue;
        }
        let fragment = FragmentUri::parse(child)?;
        if fragment.t_first() <= timestamp {
            fragments.push(fragment);
        }
    }
    fragments.sort();
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_uri() -> Uri {
        Uri::new("/arrays/a1")
    }

    #[test]
    fn generate_then_parse_round_trips() {
        let frag = FragmentUri::generate(&array_uri(), 100, 200);
        let parsed = FragmentUri::parse(frag.uri()).unwrap();
        assert_eq!(parsed, frag);
        assert_eq!(parsed.version(), FORMAT_VERSION);
    }

    #[test]
    fn legacy_layout_parses_as_version_three() {
        let uuid = Uuid::new_v4();
        let uri = array_uri().join(&format!("__{uuid}_5_9"));
        let frag = FragmentUri::parse(&uri).unwrap();
        assert_eq!(frag.t_first(), 5);
        assert_eq!(frag.t_last(), 9);
        assert_eq!(frag.version(), 3);
    }

    #[test]
    fn inverted_range_rejected() {
        let uuid = Uuid::new_v4();
        let uri = array_uri().join(&format!("__9_5_{uuid}_4"));
        let err = FragmentUri::parse(&uri).unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::InvalidFragment(String::new())
        ));
    }

    #[test]
    fn future_version_unsupported() {
        let uuid = Uuid::new_v4();
        let uri = array_uri().join(&format!("__1_2_{uuid}_{}", FORMAT_VERSION + 1));
        let err = FragmentUri::parse(&uri).unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::UnsupportedVersion(String::new())
        ));
    }

    #[test]
    fn malformed_uuid_rejected() {
        let uri = array_uri().join("__1_2_not-a-uuid_4");
        assert!(FragmentUri::parse(&uri).is_err());
    }

    #[test]
    fn marker_files_are_not_fragments() {
        assert!(!FragmentUri::is_fragment_name("__array_schema.tsr"));
        assert!(!FragmentUri::is_fragment_name("__lock.tsr"));
        assert!(!FragmentUri::is_fragment_name("stray.txt"));
    }

    #[test]
    fn ordering_is_timestamp_then_uuid() {
        let a = FragmentUri::parse(
            &array_uri().join("__5_5_aaaaaaaa-0000-4000-8000-000000000000_4"),
        )
        .unwrap();
        let b = FragmentUri::parse(
            &array_uri().join("__5_5_bbbbbbbb-0000-4000-8000-000000000000_4"),
        )
        .unwrap();
        let c = FragmentUri::parse(
            &array_uri().join("__3_9_cccccccc-0000-4000-8000-000000000000_4"),
        )
        .unwrap();

        let mut v = vec![b.clone(), a.clone(), c.clone()];
        v.sort();
        assert_eq!(v, vec![c, a, b]);
    }

    #[test]
    fn visibility_filter_and_sort() {
        let children = vec![
            array_uri().join("__array_schema.tsr"),
            array_uri().join("__8_9_aaaaaaaa-0000-4000-8000-000000000000_4"),
            array_uri().join("__2_3_bbbbbbbb-0000-4000-8000-000000000000_4"),
            array_uri().join("__5_6_cccccccc-0000-4000-8000-000000000000_4"),
        ];
        let visible = sorted_visible_fragments(&children, 6).unwrap();
        let firsts: Vec<u64> = visible.iter().map(FragmentUri::t_first).collect();
        assert_eq!(firsts, vec![2, 5]);
    }

    #[test]
    fn visibility_at_zero_is_empty() {
        let children = vec![array_uri().join("__1_1_dddddddd-0000-4000-8000-000000000000_4")];
        assert!(sorted_visible_fragments(&children, 0).unwrap().is_empty());
    }
}
