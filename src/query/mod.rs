//! # Queries
//!
//! The contract objects the storage manager drives: a query knows its
//! type (read or write), executes with `submit`, reports a terminal
//! status, and honors cooperative cancellation through a shared flag the
//! manager installs at submission time.
//!
//! A query owns everything it needs by value or `Arc`: the schema and
//! fragment snapshot for reads, the VFS handle for writes. Nothing here
//! points back at the storage manager, and the manager does not own
//! queries; lifetimes are enforced by the open-array registry refcounts,
//! not by reference graphs.
//!
//! The shipped bodies are the minimal dense kernels plus a no-op body
//! used to exercise scheduling. Richer execution (sparse kernels, result
//! estimation, incomplete-retry) belongs to the query front-end outside
//! this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::array::{ArraySchema, Layout};
use crate::crypto::EncryptionKey;
use crate::error::StorageError;
use crate::fragment::{DenseReader, DenseWriter, FragmentMetadata, TileSource};
use crate::uri::Uri;
use crate::vfs::Vfs;

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Read,
    Write,
}

/// Query lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Uninitialized,
    InProgress,
    Incomplete,
    Completed,
    Failed,
}

enum QueryBody {
    DenseRead {
        source: Arc<dyn TileSource>,
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentMetadata>>,
        subarray: Vec<(i128, i128)>,
        attribute: String,
        layout: Layout,
    },
    DenseWrite {
        vfs: Arc<Vfs>,
        array_uri: Uri,
        schema: Arc<ArraySchema>,
        key: EncryptionKey,
        subarray: Vec<(i128, i128)>,
        data: Vec<(String, Vec<u8>)>,
        timestamp: Option<u64>,
    },
    Noop,
    /// Consumed by a successful submit.
    Done,
}

/// A schedulable unit of work against one array.
pub struct Query {
    query_type: QueryType,
    status: Mutex<QueryStatus>,
    body: Mutex<QueryBody>,
    cancel_flag: Mutex<Option<Arc<AtomicBool>>>,
    read_result: Mutex<Option<Vec<u8>>>,
    written_fragment: Mutex<Option<FragmentMetadata>>,
}

impl Query {
    /// Dense subarray read over a snapshot.
    pub fn dense_read(
        source: Arc<dyn TileSource>,
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentMetadata>>,
        subarray: Vec<(i128, i128)>,
        attribute: &str,
        layout: Layout,
    ) -> Self {
        Self::with_body(
            QueryType::Read,
            QueryBody::DenseRead {
                source,
                schema,
                fragments,
                subarray,
                attribute: attribute.to_string(),
                layout,
            },
        )
    }

    /// Dense subarray write producing one new fragment. `timestamp: None`
    /// stamps the fragment with the wall clock at submit time.
    pub fn dense_write(
        vfs: Arc<Vfs>,
        array_uri: Uri,
        schema: Arc<ArraySchema>,
        key: EncryptionKey,
        subarray: Vec<(i128, i128)>,
        data: Vec<(String, Vec<u8>)>,
        timestamp: Option<u64>,
    ) -> Self {
        Self::with_body(
            QueryType::Write,
            QueryBody::DenseWrite {
                vfs,
                array_uri,
                schema,
                key,
                subarray,
                data,
                timestamp,
            },
        )
    }

    /// A query that does nothing; used to exercise submission paths.
    pub fn noop(query_type: QueryType) -> Self {
        Self::with_body(query_type, QueryBody::Noop)
    }

    fn with_body(query_type: QueryType, body: QueryBody) -> Self {
        Self {
            query_type,
            status: Mutex::new(QueryStatus::Uninitialized),
            body: Mutex::new(body),
            cancel_flag: Mutex::new(None),
            read_result: Mutex::new(None),
            written_fragment: Mutex::new(None),
        }
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn status(&self) -> QueryStatus {
        *self.status.lock()
    }

    /// Installed by the storage manager before execution so the query can
    /// observe `cancel_all_tasks`.
    pub fn set_cancellation_flag(&self, flag: Arc<AtomicBool>) {
        *self.cancel_flag.lock() = Some(flag);
    }

    /// Cooperative cancellation probe; kernels call this at their
    /// checkpoints.
    pub fn cancel_check(&self) -> Result<()> {
        let cancelled = self
            .cancel_flag
            .lock()
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Acquire));
        if cancelled {
            eyre::bail!(StorageError::Cancelled("query cancelled".into()));
        }
        Ok(())
    }

    /// Executes the query on the calling thread and returns its terminal
    /// status. A second submit of a completed query is a no-op returning
    /// `Completed`.
    pub fn submit(&self) -> Result<QueryStatus> {
        {
            let mut status = self.status.lock();
            if *status == QueryStatus::Completed {
                return Ok(QueryStatus::Completed);
            }
            *status = QueryStatus::InProgress;
        }

        let outcome = self.run_body();
        let terminal = match &outcome {
            Ok(()) => QueryStatus::Completed,
            Err(_) => QueryStatus::Failed,
        };
        *self.status.lock() = terminal;
        outcome.map(|()| terminal)
    }

    fn run_body(&self) -> Result<()> {
        self.cancel_check()?;
        let body = std::mem::replace(&mut *self.body.lock(), QueryBody::Done);
        match body {
            QueryBody::DenseRead {
                source,
                schema,
                fragments,
                subarray,
                attribute,
                layout,
            } => {
                let out = DenseReader::read(
                    source.as_ref(),
                    &schema,
                    &fragments,
                    &subarray,
                    &attribute,
                    layout,
                )?;
                debug!(attribute = %attribute, bytes = out.len(), "dense read completed");
                *self.read_result.lock() = Some(out);
                Ok(())
            }
            QueryBody::DenseWrite {
                vfs,
                array_uri,
                schema,
                key,
                subarray,
                data,
                timestamp,
            } => {
                let ts = timestamp.unwrap_or_else(crate::fragment::wallclock_millis);
                let meta =
                    DenseWriter::write(&vfs, &array_uri, &schema, &key, &subarray, &data, ts)?;
                *self.written_fragment.lock() = Some(meta);
                Ok(())
            }
            QueryBody::Noop => Ok(()),
            QueryBody::Done => eyre::bail!(StorageError::InvalidArgument(
                "query was already consumed by a previous submit".into()
            )),
        }
    }

    /// The cells materialized by a completed read, in the requested
    /// layout. `None` before completion or for writes.
    pub fn take_read_result(&self) -> Option<Vec<u8>> {
        self.read_result.lock().take()
    }

    /// The fragment produced by a completed write.
    pub fn take_written_fragment(&self) -> Option<FragmentMetadata> {
        self.written_fragment.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_completes() {
        let q = Query::noop(QueryType::Read);
        assert_eq!(q.status(), QueryStatus::Uninitialized);
        assert_eq!(q.submit().unwrap(), QueryStatus::Completed);
        assert_eq!(q.status(), QueryStatus::Completed);
    }

    #[test]
    fn resubmit_of_completed_query_is_idempotent() {
        let q = Query::noop(QueryType::Write);
        q.submit().unwrap();
        assert_eq!(q.submit().unwrap(), QueryStatus::Completed);
    }

    #[test]
    fn cancelled_flag_fails_submit() {
        let q = Query::noop(QueryType::Read);
        let flag = Arc::new(AtomicBool::new(true));
        q.set_cancellation_flag(flag);

        let err = q.submit().unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::Cancelled(String::new())
        ));
        assert_eq!(q.status(), QueryStatus::Failed);
    }

    #[test]
    fn unset_flag_means_not_cancelled() {
        let q = Query::noop(QueryType::Read);
        q.cancel_check().unwrap();
    }
}
