//! # Storage Manager
//!
//! The façade binding the whole core together: it owns the open-array
//! registries, the tile cache, the three thread pools, the exclusive-lock
//! table, and the in-progress counter, and exposes every array lifecycle,
//! query, cache, and filesystem operation the engine serves.
//!
//! ## Locking Discipline
//!
//! Lock order is registry mutex → entry mutex → cache mutex → VFS. The
//! registry mutexes are held only for map manipulation and refcounts,
//! never across blocking VFS calls. Entry mutexes are held across
//! fragment-metadata I/O; entries are independent, so only openers of the
//! same array wait. The xlock condition variable is paired exclusively
//! with the read-registry mutex.
//!
//! ## MVCC Snapshots
//!
//! Opening for reads at timestamp `t` yields `(schema, metadata list)`
//! where every fragment satisfies `t_first ≤ t`, ordered by
//! `(t_first, uuid)`. The metadata objects are owned by the open-array
//! entry and shared by reference; a reopen extends the entry's map and
//! hands back the same `Arc`s for fragments already loaded.
//!
//! ## Teardown
//!
//! `cancel_all_tasks` sets the shared cancellation flag, refuses new
//! operations, waits for the in-progress counter to drain to zero, then
//! resets both so the manager can be used again.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::object::{self, ObjectIter, ObjectType, WalkOrder};
use super::open_array::{OpenArray, OpenMode};
use crate::array::ArraySchema;
use crate::cache::{TileCache, TileKey};
use crate::config::{
    Config, ARRAY_SCHEMA_FILENAME, FILELOCK_NAME, GROUP_FILENAME, KV_SCHEMA_FILENAME,
    WRITE_FILELOCK_NAME,
};
use crate::crypto::EncryptionKey;
use crate::error::StorageError;
use crate::fragment::{
    sorted_visible_fragments, FragmentInfo, FragmentMetadata, FragmentUri, TileSource,
};
use crate::pool::{CancelableTasks, ThreadPool};
use crate::query::{Query, QueryStatus, QueryType};
use crate::uri::Uri;
use crate::vfs::{FileLock, LockMode, Vfs};

/// Completion hook for async query submission; receives the terminal
/// status or the error that ended the query.
pub type QueryCallback = Box<dyn FnOnce(Result<QueryStatus>) + Send + 'static>;

enum XlockSlot {
    /// Claimed in the table; the exclusive filelock acquisition is in
    /// flight outside the registry mutex.
    Reserved,
    Held(FileLock),
}

/// The core storage engine façade. One value per process component;
/// passed explicitly; there are no hidden singletons.
pub struct StorageManager {
    config: Config,
    vfs: Arc<Vfs>,
    tile_cache: Arc<TileCache>,
    async_pool: Arc<ThreadPool>,
    reader_pool: Arc<ThreadPool>,
    writer_pool: Arc<ThreadPool>,
    cancelable: Arc<CancelableTasks>,
    open_arrays_for_reads: Mutex<HashMap<Uri, Arc<OpenArray>>>,
    open_arrays_for_writes: Mutex<HashMap<Uri, Arc<OpenArray>>>,
    /// Exclusive lock table; guarded by its own mutex, waited on through
    /// `xlock_cv` paired with the read-registry mutex.
    xlocks: Mutex<HashMap<Uri, XlockSlot>>,
    xlock_cv: Condvar,
    /// Serializes object creation so two creators cannot interleave
    /// directory and marker-file writes.
    object_create_mtx: Mutex<()>,
    in_progress: InProgress,
}

impl StorageManager {
    pub fn new(config: Config) -> Result<Self> {
        let vfs = Arc::new(Vfs::new(&config));
        let tile_cache = Arc::new(TileCache::new(config.tile_cache_size()?));
        let async_pool = Arc::new(ThreadPool::new(config.num_async_threads()?, "async"));
        let reader_pool = Arc::new(ThreadPool::new(config.num_reader_threads()?, "reader"));
        let writer_pool = Arc::new(ThreadPool::new(config.num_writer_threads()?, "writer"));

        Ok(Self {
            config,
            vfs,
            tile_cache,
            async_pool,
            reader_pool,
            writer_pool,
            cancelable: Arc::new(CancelableTasks::new()),
            open_arrays_for_reads: Mutex::new(HashMap::new()),
            open_arrays_for_writes: Mutex::new(HashMap::new()),
            xlocks: Mutex::new(HashMap::new()),
            xlock_cv: Condvar::new(),
            object_create_mtx: Mutex::new(()),
            in_progress: InProgress::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vfs(&self) -> Arc<Vfs> {
        Arc::clone(&self.vfs)
    }

    pub fn reader_pool(&self) -> Arc<ThreadPool> {
        Arc::clone(&self.reader_pool)
    }

    pub fn writer_pool(&self) -> Arc<ThreadPool> {
        Arc::clone(&self.writer_pool)
    }

    /// A cache-through tile source for read kernels: tile cache first,
    /// VFS on miss, populating the cache on the way out.
    pub fn tile_source(&self) -> Arc<dyn TileSource> {
        Arc::new(CacheBackedTileSource {
            vfs: Arc::clone(&self.vfs),
            cache: Arc::clone(&self.tile_cache),
        })
    }

    // ==================================================================
    // Array lifecycle
    // ==================================================================

    /// Creates an array: directory, schema file, lock file. Fails with
    /// `AlreadyExists` when the URI already resolves to anything.
    pub fn array_create(
        &self,
        array_uri: &Uri,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        let _create = self.object_create_mtx.lock();

        schema.check()?;
        if self.vfs.is_dir(array_uri)? || self.vfs.is_file(array_uri)? {
            eyre::bail!(StorageError::AlreadyExists(format!(
                "cannot create array at '{array_uri}'"
            )));
        }
        self.vfs.create_dir(array_uri)?;

        let written = (|| -> Result<()> {
            let filename = if schema.is_key_value() {
                KV_SCHEMA_FILENAME
            } else {
                ARRAY_SCHEMA_FILENAME
            };
            let schema_uri = array_uri.join(filename);
            self.vfs.write(&schema_uri, &schema.serialize(key))?;
            self.vfs.sync(&schema_uri)?;
            self.vfs.touch(&array_uri.join(FILELOCK_NAME))?;
            Ok(())
        })();

        if let Err(e) = written {
            let _ = self.vfs.remove(array_uri);
            return Err(e).wrap_err_with(|| format!("creating array '{array_uri}'"));
        }
        info!(array = %array_uri, "created array");
        Ok(())
    }

    /// Creates a group: a directory carrying the group marker file.
    pub fn group_create(&self, group_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        let _create = self.object_create_mtx.lock();

        if object::object_type(&self.vfs, group_uri)? != ObjectType::Invalid {
            eyre::bail!(StorageError::AlreadyExists(format!(
                "cannot create group at '{group_uri}'"
            )));
        }
        if !self.vfs.is_dir(group_uri)? {
            self.vfs.create_dir(group_uri)?;
        }
        self.vfs.touch(&group_uri.join(GROUP_FILENAME))?;
        info!(group = %group_uri, "created group");
        Ok(())
    }

    /// Opens an array for reads at `timestamp`, returning the snapshot:
    /// the shared schema and the metadata of every fragment with
    /// `t_first ≤ timestamp`, ordered `(t_first, uuid)` ascending.
    pub fn array_open_for_reads(
        &self,
        array_uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let _gate = self.in_progress.enter()?;
        let entry = self.open_array_entry(array_uri, key, OpenMode::Read)?;

        let snapshot = (|| {
            let children = self.vfs.ls(array_uri)?;
            let fragments = sorted_visible_fragments(&children, timestamp)?;
            self.snapshot_from(&entry, key, &fragments)
        })();

        match snapshot {
            Ok(s) => {
                debug!(array = %array_uri, timestamp, fragments = s.1.len(), "opened for reads");
                Ok(s)
            }
            Err(e) => {
                let _ = self.close_entry(array_uri, OpenMode::Read);
                Err(e).wrap_err_with(|| format!("opening array '{array_uri}' for reads"))
            }
        }
    }

    /// Opens an array for reads over an explicit fragment list instead of
    /// enumerating the directory. The list is sorted internally.
    pub fn array_open_for_reads_with_fragments(
        &self,
        array_uri: &Uri,
        fragment_uris: &[Uri],
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let _gate = self.in_progress.enter()?;
        let entry = self.open_array_entry(array_uri, key, OpenMode::Read)?;

        let snapshot = (|| {
            let mut fragments = fragment_uris
                .iter()
                .map(FragmentUri::parse)
                .collect::<Result<Vec<_>>>()?;
            fragments.sort();
            fragments.dedup();
            self.snapshot_from(&entry, key, &fragments)
        })();

        match snapshot {
            Ok(s) => Ok(s),
            Err(e) => {
                let _ = self.close_entry(array_uri, OpenMode::Read);
                Err(e).wrap_err_with(|| format!("opening array '{array_uri}' for reads"))
            }
        }
    }

    /// Opens an array for writes. No fragment metadata is loaded: writes
    /// produce new fragments rather than reading existing ones.
    pub fn array_open_for_writes(
        &self,
        array_uri: &Uri,
        key: &EncryptionKey,
    ) -> Result<Arc<ArraySchema>> {
        let _gate = self.in_progress.enter()?;
        let entry = self.open_array_entry(array_uri, key, OpenMode::Write)?;
        let schema = entry.schema().ok_or_else(|| {
            eyre::eyre!(StorageError::InternalError(
                "open-for-writes entry has no schema".into()
            ))
        })?;
        debug!(array = %array_uri, "opened for writes");
        Ok(schema)
    }

    /// Re-enumerates fragments for an array already open for reads,
    /// extending the entry's metadata map. Previously loaded fragments
    /// keep their exact metadata objects.
    pub fn array_reopen(
        &self,
        array_uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let _gate = self.in_progress.enter()?;
        let entry = self
            .open_arrays_for_reads
            .lock()
            .get(array_uri)
            .cloned()
            .ok_or_else(|| {
                eyre::eyre!(StorageError::InvalidArgument(format!(
                    "cannot reopen '{array_uri}': not open for reads"
                )))
            })?;

        let children = self.vfs.ls(array_uri)?;
        let fragments = sorted_visible_fragments(&children, timestamp)?;
        self.snapshot_from(&entry, key, &fragments)
            .wrap_err_with(|| format!("reopening array '{array_uri}'"))
    }

    pub fn array_close_for_reads(&self, array_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.close_entry(array_uri, OpenMode::Read)?;
        debug!(array = %array_uri, "closed for reads");
        Ok(())
    }

    pub fn array_close_for_writes(&self, array_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.close_entry(array_uri, OpenMode::Write)?;
        debug!(array = %array_uri, "closed for writes");
        Ok(())
    }

    /// Union of the fragments' non-empty domains, or `None` for an empty
    /// snapshot.
    pub fn array_get_non_empty_domain(
        &self,
        schema: &ArraySchema,
        fragments: &[Arc<FragmentMetadata>],
    ) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        let Some(first) = fragments.first() else {
            return Ok(None);
        };
        let coords = schema.coords_type();
        let mut union: Vec<(Vec<u8>, Vec<u8>)> = first.non_empty_domain().to_vec();
        for meta in &fragments[1..] {
            for (acc, (lo, hi)) in union.iter_mut().zip(meta.non_empty_domain()) {
                if coords.cmp_cells(lo, &acc.0) == std::cmp::Ordering::Less {
                    acc.0 = lo.clone();
                }
                if coords.cmp_cells(hi, &acc.1) == std::cmp::Ordering::Greater {
                    acc.1 = hi.clone();
                }
            }
        }
        Ok(Some(union))
    }

    // ==================================================================
    // Consolidation locks
    // ==================================================================

    /// Exclusively locks an array against read-mode opens. Blocks until
    /// the array's read entry is fully closed, then claims the lock table
    /// slot and acquires the exclusive filelock. Held only for the
    /// directory-mutation phase of consolidation.
    pub fn array_xlock(&self, array_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        match object::object_type(&self.vfs, array_uri)? {
            ObjectType::Array | ObjectType::KeyValue => {}
            _ => eyre::bail!(StorageError::NotFound(format!(
                "cannot xlock '{array_uri}': not an array"
            ))),
        }

        // Claim the slot once no read entry and no other xlock exist.
        {
            let mut reads = self.open_arrays_for_reads.lock();
            loop {
                let blocked =
                    reads.contains_key(array_uri) || self.xlocks.lock().contains_key(array_uri);
                if !blocked {
                    break;
                }
                self.xlock_cv.wait(&mut reads);
            }
            self.xlocks
                .lock()
                .insert(array_uri.clone(), XlockSlot::Reserved);
        }

        // Acquire the filelock outside the registry mutex; it may block
        // on readers in other processes.
        match self
            .vfs
            .filelock_lock(&array_uri.join(FILELOCK_NAME), LockMode::Exclusive)
        {
            Ok(lock) => {
                self.xlocks
                    .lock()
                    .insert(array_uri.clone(), XlockSlot::Held(lock));
                info!(array = %array_uri, "xlocked");
                Ok(())
            }
            Err(e) => {
                {
                    let _reads = self.open_arrays_for_reads.lock();
                    self.xlocks.lock().remove(array_uri);
                }
                self.xlock_cv.notify_all();
                Err(e).wrap_err_with(|| format!("xlocking array '{array_uri}'"))
            }
        }
    }

    /// Releases an exclusive lock and wakes blocked readers and lockers.
    pub fn array_xunlock(&self, array_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        let removed = {
            let _reads = self.open_arrays_for_reads.lock();
            self.xlocks.lock().remove(array_uri)
        };
        match removed {
            Some(slot) => {
                drop(slot);
                self.xlock_cv.notify_all();
                info!(array = %array_uri, "xunlocked");
                Ok(())
            }
            None => eyre::bail!(StorageError::InvalidArgument(format!(
                "array '{array_uri}' is not xlocked"
            ))),
        }
    }

    // ==================================================================
    // Fragment info
    // ==================================================================

    /// Summaries of every fragment visible at `timestamp`, ordered
    /// `(t_first, uuid)`.
    pub fn get_fragment_info(
        &self,
        array_uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<Vec<FragmentInfo>> {
        let _gate = self.in_progress.enter()?;
        let schema = self.load_schema_inner(array_uri, key)?;
        let children = self.vfs.ls(array_uri)?;
        let fragments = sorted_visible_fragments(&children, timestamp)?;

        let mut infos = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let meta = FragmentMetadata::load(&self.vfs, fragment, &schema, key)?;
            infos.push(FragmentInfo::from_metadata(&meta));
        }
        Ok(infos)
    }

    /// Summary of one fragment URI.
    pub fn get_fragment_info_for_uri(
        &self,
        schema: &ArraySchema,
        fragment_uri: &Uri,
        key: &EncryptionKey,
    ) -> Result<FragmentInfo> {
        let _gate = self.in_progress.enter()?;
        let fragment = FragmentUri::parse(fragment_uri)?;
        let meta = FragmentMetadata::load(&self.vfs, &fragment, schema, key)?;
        Ok(FragmentInfo::from_metadata(&meta))
    }

    // ==================================================================
    // Schema persistence
    // ==================================================================

    /// Persists a schema into an array directory, replacing any previous
    /// schema file.
    pub fn store_array_schema(
        &self,
        array_uri: &Uri,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        schema.check()?;
        let filename = if schema.is_key_value() {
            KV_SCHEMA_FILENAME
        } else {
            ARRAY_SCHEMA_FILENAME
        };
        let schema_uri = array_uri.join(filename);
        if self.vfs.is_file(&schema_uri)? {
            self.vfs.remove(&schema_uri)?;
        }
        self.vfs.write(&schema_uri, &schema.serialize(key))?;
        self.vfs.sync(&schema_uri)?;
        Ok(())
    }

    /// Loads and validates an array schema from persistent storage.
    pub fn load_array_schema(&self, array_uri: &Uri, key: &EncryptionKey) -> Result<ArraySchema> {
        let _gate = self.in_progress.enter()?;
        self.load_schema_inner(array_uri, key)
    }

    // ==================================================================
    // Query execution
    // ==================================================================

    /// Runs a query on the calling thread and returns its terminal
    /// status.
    pub fn query_submit(&self, query: &Query) -> Result<QueryStatus> {
        let _gate = self.in_progress.enter()?;
        query.set_cancellation_flag(self.cancelable.cancellation_flag());
        query.submit()
    }

    /// Enqueues a query onto the async pool and returns immediately. The
    /// async task dispatches to the reader or writer pool by query type;
    /// the in-progress gate is released when the query reaches a terminal
    /// state, and `callback` (if any) receives the outcome.
    pub fn query_submit_async(
        &self,
        query: Arc<Query>,
        callback: Option<QueryCallback>,
    ) -> Result<()> {
        let gate = self.in_progress.enter()?;
        query.set_cancellation_flag(self.cancelable.cancellation_flag());

        let target = match query.query_type() {
            QueryType::Read => Arc::clone(&self.reader_pool),
            QueryType::Write => Arc::clone(&self.writer_pool),
        };
        let cancelable = Arc::clone(&self.cancelable);

        self.cancelable.execute(&self.async_pool, move || {
            let _gate = gate;
            let inner = cancelable.execute(&target, move || query.submit());
            let outcome = inner.wait();
            match callback {
                Some(cb) => {
                    cb(outcome);
                    Ok(())
                }
                None => outcome.map(|_| ()),
            }
        });
        Ok(())
    }

    // ==================================================================
    // Teardown
    // ==================================================================

    /// Cancels queued tasks, refuses new operations, and blocks until the
    /// in-progress counter reaches zero. The manager is reusable after
    /// this returns.
    pub fn cancel_all_tasks(&self) -> Result<()> {
        info!("cancelling all tasks");
        self.cancelable.cancel_all();
        self.in_progress.begin_drain();
        self.in_progress.wait_zero();
        self.cancelable.reset();
        self.in_progress.end_drain();
        Ok(())
    }

    /// True while `cancel_all_tasks` is draining.
    pub fn cancellation_in_progress(&self) -> bool {
        self.cancelable.is_cancelled()
    }

    /// Number of operations currently holding the in-progress gate.
    pub fn queries_in_progress(&self) -> u64 {
        self.in_progress.count()
    }

    // ==================================================================
    // Cache passthrough
    // ==================================================================

    /// Reads a cached tile into `buffer`; returns whether it was in
    /// cache.
    pub fn read_from_cache(
        &self,
        uri: &Uri,
        offset: u64,
        buffer: &mut Vec<u8>,
        nbytes: u64,
    ) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        Ok(self
            .tile_cache
            .read(&TileKey::new(uri.clone(), offset), buffer, nbytes))
    }

    /// Caches tile bytes. Advisory: oversize values are dropped silently.
    pub fn write_to_cache(&self, uri: &Uri, offset: u64, bytes: Vec<u8>) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.tile_cache.insert(TileKey::new(uri.clone(), offset), bytes);
        Ok(())
    }

    /// Uncached positional read through the VFS.
    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut Vec<u8>, nbytes: u64) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.read(uri, offset, buffer, nbytes)
    }

    /// Uncached append through the VFS.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.write(uri, data)
    }

    // ==================================================================
    // Filesystem helpers
    // ==================================================================

    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.create_dir(uri)
    }

    pub fn touch(&self, uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.touch(uri)
    }

    pub fn close_file(&self, uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.close_file(uri)
    }

    pub fn sync(&self, uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        self.vfs.sync(uri)
    }

    pub fn is_dir(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        self.vfs.is_dir(uri)
    }

    pub fn is_file(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        self.vfs.is_file(uri)
    }

    pub fn is_array(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        Ok(object::object_type(&self.vfs, uri)? == ObjectType::Array)
    }

    pub fn is_group(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        Ok(object::object_type(&self.vfs, uri)? == ObjectType::Group)
    }

    pub fn is_kv(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        Ok(object::object_type(&self.vfs, uri)? == ObjectType::KeyValue)
    }

    pub fn is_fragment(&self, uri: &Uri) -> Result<bool> {
        let _gate = self.in_progress.enter()?;
        object::is_fragment_dir(&self.vfs, uri)
    }

    pub fn object_type(&self, uri: &Uri) -> Result<ObjectType> {
        let _gate = self.in_progress.enter()?;
        object::object_type(&self.vfs, uri)
    }

    /// Removes a tessera object (array, group, or key-value store).
    pub fn object_remove(&self, uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        if object::object_type(&self.vfs, uri)? == ObjectType::Invalid {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "'{uri}' is not a tessera object"
            )));
        }
        self.vfs.remove(uri)
    }

    /// Renames a tessera object; an existing destination is overwritten.
    pub fn object_move(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()> {
        let _gate = self.in_progress.enter()?;
        if object::object_type(&self.vfs, old_uri)? == ObjectType::Invalid {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "'{old_uri}' is not a tessera object"
            )));
        }
        self.vfs.move_object(old_uri, new_uri)
    }

    // ==================================================================
    // Object iteration
    // ==================================================================

    /// Recursive walk over the objects under `path`.
    pub fn object_iter_begin(&self, path: &Uri, order: WalkOrder) -> Result<ObjectIter> {
        let _gate = self.in_progress.enter()?;
        ObjectIter::new(&self.vfs, path, order, true)
    }

    /// Non-recursive walk over the direct children of `path`.
    pub fn object_iter_begin_children(&self, path: &Uri) -> Result<ObjectIter> {
        let _gate = self.in_progress.enter()?;
        ObjectIter::new(&self.vfs, path, WalkOrder::Preorder, false)
    }

    pub fn object_iter_next(&self, iter: &mut ObjectIter) -> Result<Option<(Uri, ObjectType)>> {
        let _gate = self.in_progress.enter()?;
        iter.next_object(&self.vfs)
    }

    /// Releases an iterator. Present for API symmetry; dropping the value
    /// is equivalent.
    pub fn object_iter_free(&self, iter: ObjectIter) {
        drop(iter);
    }

    // ==================================================================
    // Internals
    // ==================================================================

    /// Finds or creates the registry entry for `(array_uri, mode)` and
    /// ensures its schema is loaded and its filelock held. Read-mode
    /// opens block while the array is xlocked.
    fn open_array_entry(
        &self,
        array_uri: &Uri,
        key: &EncryptionKey,
        mode: OpenMode,
    ) -> Result<Arc<OpenArray>> {
        let registry = self.registry(mode);
        let entry = {
            let mut map = registry.lock();
            if mode == OpenMode::Read {
                while self.xlocks.lock().contains_key(array_uri) {
                    self.xlock_cv.wait(&mut map);
                }
            }
            match map.get(array_uri) {
                Some(e) => {
                    e.incr_cnt();
                    Arc::clone(e)
                }
                None => {
                    let e = Arc::new(OpenArray::new(array_uri.clone(), mode));
                    e.incr_cnt();
                    map.insert(array_uri.clone(), Arc::clone(&e));
                    e
                }
            }
        };

        // Entry-mutex phase: first opener loads the schema and acquires
        // the filelock; later openers find the schema present and only
        // prove they hold the same key.
        let loaded = (|| -> Result<()> {
            let mut state = entry.state();
            match &state.schema {
                Some(_) => {
                    let stored = state.key_digest.unwrap_or_default();
                    key.check_digest(&stored, &format!("array '{array_uri}'"))
                }
                None => {
                    let schema = self.load_schema_inner(array_uri, key)?;
                    let (lock_file, lock_mode) = match mode {
                        OpenMode::Read => (FILELOCK_NAME, LockMode::Shared),
                        OpenMode::Write => (WRITE_FILELOCK_NAME, LockMode::Exclusive),
                    };
                    let lock = self
                        .vfs
                        .filelock_lock(&array_uri.join(lock_file), lock_mode)?;
                    entry.set_filelock(lock);
                    state.key_digest = Some(key.digest());
                    state.schema = Some(Arc::new(schema));
                    Ok(())
                }
            }
        })();

        if let Err(e) = loaded {
            let _ = self.close_entry(array_uri, mode);
            return Err(e);
        }
        Ok(entry)
    }

    /// Loads the metadata of `fragments` through the entry's cache,
    /// returning the snapshot `(schema, ordered metadata)`.
    fn snapshot_from(
        &self,
        entry: &Arc<OpenArray>,
        key: &EncryptionKey,
        fragments: &[FragmentUri],
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let mut state = entry.state();
        let schema = state.schema.clone().ok_or_else(|| {
            eyre::eyre!(StorageError::InternalError(
                "open-array entry has no schema".into()
            ))
        })?;

        let mut metas = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            if let Some(meta) = state.metadata.get(fragment.name()) {
                metas.push(Arc::clone(meta));
                continue;
            }
            let meta = Arc::new(FragmentMetadata::load(&self.vfs, fragment, &schema, key)?);
            state.metadata.insert(fragment.name().to_string(), Arc::clone(&meta));
            metas.push(meta);
            debug!(fragment = fragment.name(), "loaded fragment metadata");
        }
        Ok((schema, metas))
    }

    /// Decrements the entry refcount under the registry mutex; at zero,
    /// removes the entry, notifies xlock waiters, and releases the
    /// filelock.
    fn close_entry(&self, array_uri: &Uri, mode: OpenMode) -> Result<()> {
        let lock_to_release = {
            let mut map = self.registry(mode).lock();
            let Some(entry) = map.get(array_uri) else {
                eyre::bail!(StorageError::InvalidArgument(format!(
                    "array '{array_uri}' is not open"
                )));
            };
            if entry.decr_cnt() > 0 {
                None
            } else {
                let entry = map.remove(array_uri).expect("entry present");
                let lock = entry.take_filelock();
                if mode == OpenMode::Read {
                    self.xlock_cv.notify_all();
                }
                lock
            }
        };
        drop(lock_to_release);
        Ok(())
    }

    fn registry(&self, mode: OpenMode) -> &Mutex<HashMap<Uri, Arc<OpenArray>>> {
        match mode {
            OpenMode::Read => &self.open_arrays_for_reads,
            OpenMode::Write => &self.open_arrays_for_writes,
        }
    }

    fn load_schema_inner(&self, array_uri: &Uri, key: &EncryptionKey) -> Result<ArraySchema> {
        let kv_uri = array_uri.join(KV_SCHEMA_FILENAME);
        let array_schema_uri = array_uri.join(ARRAY_SCHEMA_FILENAME);
        let schema_uri = if self.vfs.is_file(&kv_uri)? {
            kv_uri
        } else if self.vfs.is_file(&array_schema_uri)? {
            array_schema_uri
        } else {
            eyre::bail!(StorageError::NotFound(format!(
                "array '{array_uri}' does not exist"
            )));
        };

        let size = self.vfs.file_size(&schema_uri)?;
        let mut bytes = Vec::new();
        self.vfs.read(&schema_uri, 0, &mut bytes, size)?;
        ArraySchema::deserialize(&bytes, key)
            .wrap_err_with(|| format!("loading schema of '{array_uri}'"))
    }

    /// Refcount of the read-mode entry for `array_uri`, if one exists.
    /// Introspection only; the value may be stale by the time it is read.
    pub fn open_array_read_refcount(&self, array_uri: &Uri) -> Option<u64> {
        self.open_arrays_for_reads
            .lock()
            .get(array_uri)
            .map(|e| e.cnt())
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.async_pool.shutdown();
        self.reader_pool.shutdown();
        self.writer_pool.shutdown();
    }
}

/// Cache-through tile source handed to read kernels.
struct CacheBackedTileSource {
    vfs: Arc<Vfs>,
    cache: Arc<TileCache>,
}

impl TileSource for CacheBackedTileSource {
    fn fetch_tile(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Vec<u8>> {
        let key = TileKey::new(uri.clone(), offset);
        let mut buf = Vec::new();
        if self.cache.read(&key, &mut buf, nbytes) {
            return Ok(buf);
        }
        self.vfs.read(uri, offset, &mut buf, nbytes)?;
        self.cache.insert(key, buf.clone());
        Ok(buf)
    }
}

/// The process-wide count of operations in flight, with drain support.
///
/// States: idle (count 0), active (count > 0), draining (no new entries
/// accepted until the count returns to zero). Guards own an `Arc` so
/// async submissions can carry them into pool closures; the gate then
/// releases exactly when the task reaches a terminal state.
struct InProgress {
    inner: Arc<InProgressInner>,
}

struct InProgressInner {
    state: Mutex<InProgressState>,
    cv: Condvar,
}

struct InProgressState {
    count: u64,
    draining: bool,
}

impl InProgress {
    fn new() -> Self {
        Self {
            inner: Arc::new(InProgressInner {
                state: Mutex::new(InProgressState {
                    count: 0,
                    draining: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    fn enter(&self) -> Result<InProgressGuard> {
        let mut state = self.inner.state.lock();
        if state.draining {
            eyre::bail!(StorageError::Cancelled(
                "storage manager is draining".into()
            ));
        }
        state.count += 1;
        Ok(InProgressGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    fn count(&self) -> u64 {
        self.inner.state.lock().count
    }

    fn begin_drain(&self) {
        self.inner.state.lock().draining = true;
    }

    fn end_drain(&self) {
        self.inner.state.lock().draining = false;
    }

    fn wait_zero(&self) {
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            self.inner.cv.wait(&mut state);
        }
    }
}

struct InProgressGuard {
    inner: Arc<InProgressInner>,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.count -= 1;
        if state.count == 0 {
            self.inner.cv.notify_all();
        }
    }
}
