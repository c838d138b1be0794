//! # Configuration Constants
//!
//! Centralizes numeric defaults and on-disk name constants. Interdependent
//! values are co-located and their relationships documented; when changing
//! one, check the notes on its neighbors.
//!
//! ```text
//! DEFAULT_TILE_CACHE_SIZE (10 MB)
//!       │
//!       └─> must hold at least one tile of any schema the engine accepts;
//!           oversize tiles bypass the cache silently (it is advisory).
//!
//! FORMAT_VERSION (4)
//!       │
//!       ├─> fragment directories embed this version in their name
//!       └─> MIN_SUPPORTED_FORMAT_VERSION (1) bounds what the loader parses;
//!           versions 1..=3 use the legacy name layout (uuid first)
//! ```

// ============================================================================
// ON-DISK LAYOUT
// Marker file names define the object taxonomy; renaming any of them is a
// format break and requires a FORMAT_VERSION bump.
// ============================================================================

/// File suffix shared by every file tessera writes.
pub const FILE_SUFFIX: &str = ".tsr";

/// Array schema file name inside an array directory.
pub const ARRAY_SCHEMA_FILENAME: &str = "__array_schema.tsr";

/// Key-value schema file name. A key-value store is an array with a
/// reserved schema shape; the distinct file name is what the object
/// taxonomy keys on.
pub const KV_SCHEMA_FILENAME: &str = "__kv_schema.tsr";

/// Fragment metadata file name inside a fragment directory.
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata.tsr";

/// Group marker file name inside a group directory.
pub const GROUP_FILENAME: &str = "__tessera_group.tsr";

/// Shared/exclusive filelock file inside an array directory. Readers
/// hold it shared; the consolidation delete phase holds it exclusive.
pub const FILELOCK_NAME: &str = "__lock.tsr";

/// Writer filelock file inside an array directory, held exclusive by a
/// write-mode open. Kept separate from [`FILELOCK_NAME`] so one process
/// can hold the same array open for reads and writes simultaneously.
pub const WRITE_FILELOCK_NAME: &str = "__wlock.tsr";

/// Prefix of every fragment directory name.
pub const FRAGMENT_NAME_PREFIX: &str = "__";

// ============================================================================
// FORMAT VERSIONS
// ============================================================================

/// Version written into new fragments and schema files.
pub const FORMAT_VERSION: u32 = 4;

/// Oldest fragment format the loader still parses.
pub const MIN_SUPPORTED_FORMAT_VERSION: u32 = 1;

/// First version using the `__t_first_t_last_uuid_version` name layout.
/// Older fragments are named `__uuid_t_first_t_last`.
pub const FIRST_VERSIONED_NAME_FORMAT: u32 = 4;

// ============================================================================
// STORAGE MANAGER DEFAULTS
// Each has a corresponding `sm.*` config key; see `config::Config`.
// ============================================================================

/// Default tile cache capacity in bytes (`sm.tile_cache_size`).
pub const DEFAULT_TILE_CACHE_SIZE: u64 = 10 * 1024 * 1024;

/// Default consolidation step count (`sm.consolidation.steps`).
pub const DEFAULT_CONSOLIDATION_STEPS: u32 = 1;

/// Default minimum fragments per consolidation step
/// (`sm.consolidation.step_min_frags`).
pub const DEFAULT_CONSOLIDATION_STEP_MIN_FRAGS: u32 = 4;

/// Default maximum fragments per consolidation step
/// (`sm.consolidation.step_max_frags`).
pub const DEFAULT_CONSOLIDATION_STEP_MAX_FRAGS: u32 = 32;

/// Default consolidation size ratio (`sm.consolidation.step_size_ratio`).
pub const DEFAULT_CONSOLIDATION_STEP_SIZE_RATIO: f64 = 0.0;

/// Sentinel cell count meaning "variable-length attribute".
pub const CELL_VAR_NUM: u32 = u32::MAX;

/// Header size shared by schema and fragment-metadata files. The header is
/// a fixed zerocopy struct; payload begins at this offset.
pub const FILE_HEADER_SIZE: usize = 64;

/// Maximum name length for dimensions and attributes, bytes.
pub const MAX_NAME_LEN: usize = 512;

const _: () = assert!(FILE_HEADER_SIZE % 8 == 0);
const _: () = assert!(MIN_SUPPORTED_FORMAT_VERSION <= FORMAT_VERSION);
const _: () = assert!(FIRST_VERSIONED_NAME_FORMAT <= FORMAT_VERSION);
