//! # Open-Array Entries
//!
//! The registry record tracking one mode-specific opening of one array.
//! Entries are created on first open, refcounted across subsequent opens,
//! and destroyed, releasing their filelock, when the count returns to
//! zero.
//!
//! ## Locking Discipline
//!
//! Two locks with strictly separated duties:
//!
//! - the **refcount** is touched only while the owning registry map's
//!   mutex is held (the counter itself is atomic only so the entry can be
//!   shared behind an `Arc`);
//! - the **entry mutex** ([`OpenArray::state`]) protects the schema and
//!   the fragment-metadata map, and is held across metadata I/O; entries
//!   are independent, so this blocks only openers of the same array.
//!
//! Never acquire a registry mutex while holding an entry mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::array::ArraySchema;
use crate::crypto::KEY_DIGEST_LEN;
use crate::fragment::FragmentMetadata;
use crate::uri::Uri;
use crate::vfs::FileLock;

/// Registry mode; each mode has its own registry map and entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
}

/// Schema and metadata owned by an entry, guarded by the entry mutex.
#[derive(Default)]
pub struct OpenArrayState {
    /// Loaded once while the entry is in its loading phase; read-only for
    /// the rest of the entry's lifetime.
    pub schema: Option<Arc<ArraySchema>>,
    /// Digest of the key the entry was opened with; later openers must
    /// present the same key.
    pub key_digest: Option<[u8; KEY_DIGEST_LEN]>,
    /// Fragment name → loaded metadata. Insert-only; shared immutably by
    /// every reader of this entry. Write-mode entries keep it empty.
    pub metadata: HashMap<String, Arc<FragmentMetadata>>,
}

/// One mode-specific opening of one array URI.
pub struct OpenArray {
    array_uri: Uri,
    mode: OpenMode,
    /// Touched only under the owning registry mutex.
    cnt: AtomicU64,
    filelock: Mutex<Option<FileLock>>,
    state: Mutex<OpenArrayState>,
}

impl OpenArray {
    pub fn new(array_uri: Uri, mode: OpenMode) -> Self {
        Self {
            array_uri,
            mode,
            cnt: AtomicU64::new(0),
            filelock: Mutex::new(None),
            state: Mutex::new(OpenArrayState::default()),
        }
    }

    pub fn array_uri(&self) -> &Uri {
        &self.array_uri
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn cnt(&self) -> u64 {
        self.cnt.load(Ordering::Acquire)
    }

    pub fn incr_cnt(&self) {
        self.cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after decrementing.
    pub fn decr_cnt(&self) -> u64 {
        let prev = self.cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "open-array refcount underflow");
        prev - 1
    }

    pub fn set_filelock(&self, lock: FileLock) {
        *self.filelock.lock() = Some(lock);
    }

    /// Removes and returns the held filelock; dropping it releases it.
    pub fn take_filelock(&self) -> Option<FileLock> {
        self.filelock.lock().take()
    }

    /// The entry mutex. May be held across fragment-metadata I/O; only
    /// openers of the same array contend on it.
    pub fn state(&self) -> MutexGuard<'_, OpenArrayState> {
        self.state.lock()
    }

    /// The entry's schema, if loading has completed.
    pub fn schema(&self) -> Option<Arc<ArraySchema>> {
        self.state.lock().schema.clone()
    }
}
