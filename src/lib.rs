//! # Tessera - Multi-Dimensional Array Storage Engine
//!
//! Tessera is the core storage engine of a multi-dimensional array
//! database. Arrays are persisted as immutable, timestamped **fragments**;
//! every read is an MVCC snapshot over the fragment set visible at its
//! timestamp, and a process-wide storage manager coordinates open arrays,
//! caching, locking, and query scheduling across concurrent readers and
//! writers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::{Config, StorageManager, Uri};
//! use tessera::array::{ArraySchema, ArrayType, Attribute, Datatype, Dimension, Layout};
//! use tessera::crypto::EncryptionKey;
//!
//! let sm = StorageManager::new(Config::new())?;
//! let uri = Uri::new("/data/arrays/temperature");
//!
//! let schema = ArraySchema::new(
//!     ArrayType::Dense,
//!     Layout::RowMajor,
//!     Layout::RowMajor,
//!     10_000,
//!     vec![Dimension::with_integer_domain("d1", Datatype::Int64, 1, 100, 10)?],
//!     vec![Attribute::new("a", Datatype::Float64)?],
//! )?;
//! sm.array_create(&uri, &schema, &EncryptionKey::Unencrypted)?;
//!
//! let (schema, fragments) =
//!     sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)?;
//! // ... build and submit queries against the snapshot ...
//! sm.array_close_for_reads(&uri)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        StorageManager (storage)             │
//! │ open/close · xlock · submit · cancel_all    │
//! ├───────────────┬──────────────┬──────────────┤
//! │ Open-Array    │ Cancelable   │  LRU Tile    │
//! │ Registry      │ Thread Pools │  Cache       │
//! ├───────────────┴──────────────┴──────────────┤
//! │ Fragments: URIs · metadata · dense kernels  │
//! ├─────────────────────────────────────────────┤
//! │ Array schema · datatypes · encryption keys  │
//! ├─────────────────────────────────────────────┤
//! │        VFS: posix I/O and filelocks         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! array_uri/
//! ├── __array_schema.tsr        # immutable schema (zerocopy header + body)
//! ├── __lock.tsr                # shared by readers, exclusive by consolidation
//! └── __<t1>_<t2>_<uuid>_<v>/   # one directory per fragment
//!     ├── __fragment_metadata.tsr
//!     └── <attribute>.tsr       # tile data, written once
//! ```
//!
//! ## Concurrency Model
//!
//! Three bounded thread pools (async, reader, writer) execute opaque
//! closures; cancellation is cooperative through a shared flag. Lock
//! order is registry mutex → entry mutex → cache mutex → VFS, and no
//! blocking I/O ever runs under a registry mutex.
//!
//! ## Module Overview
//!
//! - [`storage`]: the storage manager, open-array registry, object walk
//! - [`fragment`]: fragment URIs, metadata, dense read/write kernels
//! - [`array`]: schema, dimensions, attributes, datatype descriptor
//! - [`cache`]: byte-bounded strict-LRU tile cache
//! - [`pool`]: FIFO thread pool and the cancelable task registry
//! - [`vfs`]: posix filesystem backend and advisory filelocks
//! - [`crypto`]: encryption keys and stored-digest validation
//! - [`config`]: runtime parameters and on-disk constants
//! - [`error`]: the `StorageError` taxonomy

#[macro_use]
mod macros;

pub mod array;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod fragment;
pub mod pool;
pub mod query;
pub mod storage;
pub mod uri;
pub mod vfs;

pub use config::Config;
pub use error::{is_storage_error, storage_error_kind, StorageError};
pub use query::{Query, QueryStatus, QueryType};
pub use storage::{ObjectType, StorageManager, WalkOrder};
pub use uri::Uri;
