//! # Storage Core
//!
//! The storage manager and its registry collaborators. Layering, leaf
//! first:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        StorageManager (façade)          │
//! │  lifecycle · xlock · queries · caches   │
//! ├──────────────────┬──────────────────────┤
//! │ Open-Array       │  Object taxonomy     │
//! │ registry entries │  and tree iteration  │
//! ├──────────────────┴──────────────────────┤
//! │ Thread pools · Tile cache · Fragments   │
//! ├─────────────────────────────────────────┤
//! │           VFS (sole I/O path)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The manager is an explicit value: construct one per engine instance
//! and pass it where it is needed. Arrays and queries never point back at
//! it; lifetimes are enforced by entry refcounts.

pub mod manager;
pub mod object;
pub mod open_array;

pub use manager::{QueryCallback, StorageManager};
pub use object::{ObjectIter, ObjectType, WalkOrder};
pub use open_array::{OpenArray, OpenMode};
