//! # Concurrency Integration Tests
//!
//! Multi-thread scenarios over one storage manager: concurrent opens
//! sharing a registry entry, the xlock protocol against live readers,
//! mass cancellation, and reopen picking up externally written fragments
//! while keeping cached metadata pointers stable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tessera::array::{ArraySchema, ArrayType, Attribute, Datatype, Dimension, Layout};
use tessera::crypto::EncryptionKey;
use tessera::fragment::DenseWriter;
use tessera::{Config, Query, QueryType, StorageManager, Uri};

fn dense_schema() -> ArraySchema {
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

fn i32_cells(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn create_array(sm: &StorageManager, dir: &tempfile::TempDir) -> Uri {
    let uri = Uri::from(dir.path()).join("a1");
    sm.array_create(&uri, &dense_schema(), &EncryptionKey::Unencrypted)
        .unwrap();
    uri
}

fn write_dense(sm: &StorageManager, uri: &Uri, values: &[i32], timestamp: u64) {
    let schema = sm
        .array_open_for_writes(uri, &EncryptionKey::Unencrypted)
        .unwrap();
    let query = Query::dense_write(
        sm.vfs(),
        uri.clone(),
        schema,
        EncryptionKey::Unencrypted,
        vec![(1, 2), (1, 2)],
        vec![("a".to_string(), i32_cells(values))],
        Some(timestamp),
    );
    sm.query_submit(&query).unwrap();
    sm.array_close_for_writes(uri).unwrap();
}

#[test]
fn s3_xlock_waits_for_readers_then_acquires() {
    let dir = tempfile::tempdir().unwrap();
    let sm = Arc::new(StorageManager::new(Config::new()).unwrap());
    let uri = create_array(&sm, &dir);

    // Two threads open for reads and confirm before the xlock starts.
    let barrier = Arc::new(Barrier::new(3));
    let mut readers = Vec::new();
    for _ in 0..2 {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        let barrier = Arc::clone(&barrier);
        readers.push(thread::spawn(move || {
            sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
                .unwrap();
            barrier.wait();
            // Hold the open long enough for the xlock to be observed
            // blocking, then close.
            thread::sleep(Duration::from_millis(300));
            sm.array_close_for_reads(&uri).unwrap();
        }));
    }
    barrier.wait();
    assert_eq!(sm.open_array_read_refcount(&uri), Some(2));

    let (tx, rx) = mpsc::channel();
    let xlocker = {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        thread::spawn(move || {
            let start = Instant::now();
            sm.array_xlock(&uri).unwrap();
            tx.send(start.elapsed()).unwrap();
        })
    };

    // The xlock must not complete while both readers are open.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    for r in readers {
        r.join().unwrap();
    }
    // After the readers close, the xlock resolves within bounded time.
    rx.recv_timeout(Duration::from_secs(5))
        .expect("xlock should acquire after readers close");
    xlocker.join().unwrap();

    // While xlocked, no read entry exists and none can be created.
    assert_eq!(sm.open_array_read_refcount(&uri), None);
    let blocked_open = {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        thread::spawn(move || {
            sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
                .unwrap();
            sm.array_close_for_reads(&uri).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked_open.is_finished());

    sm.array_xunlock(&uri).unwrap();
    blocked_open.join().unwrap();
}

#[test]
fn s4_cancellation_storm_drains_to_zero() {
    let sm = StorageManager::new(Config::new()).unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    for i in 0..100 {
        let ty = if i % 2 == 0 {
            QueryType::Read
        } else {
            QueryType::Write
        };
        let completed = Arc::clone(&completed);
        let cancelled = Arc::clone(&cancelled);
        sm.query_submit_async(
            Arc::new(Query::noop(ty)),
            Some(Box::new(move |outcome| {
                if outcome.is_ok() {
                    completed.fetch_add(1, Ordering::SeqCst);
                } else {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
        .unwrap();
    }

    sm.cancel_all_tasks().unwrap();
    assert_eq!(sm.queries_in_progress(), 0);
    assert!(!sm.cancellation_in_progress());
    assert!(completed.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst) <= 100);

    // The manager accepts work again after the drain.
    let q = Query::noop(QueryType::Read);
    sm.query_submit(&q).unwrap();
}

#[test]
fn s6_reopen_picks_up_external_fragments_and_keeps_pointers() {
    let dir = tempfile::tempdir().unwrap();
    let sm = StorageManager::new(Config::new()).unwrap();
    let uri = create_array(&sm, &dir);
    write_dense(&sm, &uri, &[1, 1, 1, 1], 1_000);

    let (_, before) = sm
        .array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
        .unwrap();
    assert_eq!(before.len(), 1);

    // Another process writes a fragment behind the manager's back.
    DenseWriter::write(
        &sm.vfs(),
        &uri,
        &dense_schema(),
        &EncryptionKey::Unencrypted,
        &[(3, 4), (3, 4)],
        &[("a".to_string(), i32_cells(&[2, 2, 2, 2]))],
        2_000,
    )
    .unwrap();

    let (_, after) = sm
        .array_reopen(&uri, u64::MAX, &EncryptionKey::Unencrypted)
        .unwrap();
    assert_eq!(after.len(), 2);
    let firsts: Vec<u64> = after.iter().map(|f| f.fragment().t_first()).collect();
    assert_eq!(firsts, vec![1_000, 2_000]);

    // The pre-existing fragment's metadata is the same cached object.
    assert!(Arc::ptr_eq(&before[0], &after[0]));

    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn law8_concurrent_opens_share_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let sm = Arc::new(StorageManager::new(Config::new()).unwrap());
    let uri = create_array(&sm, &dir);
    write_dense(&sm, &uri, &[5, 5, 5, 5], 1_000);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let sm = Arc::clone(&sm);
            let uri = uri.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let snapshot = sm
                    .array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
                    .unwrap();
                snapshot
            })
        })
        .collect();

    let snapshots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Same entry: pointer-equal schema, identical metadata objects.
    assert!(Arc::ptr_eq(&snapshots[0].0, &snapshots[1].0));
    assert_eq!(snapshots[0].1.len(), 1);
    assert!(Arc::ptr_eq(&snapshots[0].1[0], &snapshots[1].1[0]));
    assert_eq!(sm.open_array_read_refcount(&uri), Some(2));

    sm.array_close_for_reads(&uri).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
    assert_eq!(sm.open_array_read_refcount(&uri), None);
}

#[test]
fn concurrent_read_and_write_opens_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let sm = StorageManager::new(Config::new()).unwrap();
    let uri = create_array(&sm, &dir);

    let (read_schema, _) = sm
        .array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
        .unwrap();
    let write_schema = sm
        .array_open_for_writes(&uri, &EncryptionKey::Unencrypted)
        .unwrap();

    // Two independent registry entries, one schema value each.
    assert_eq!(*read_schema, *write_schema);
    assert_eq!(sm.open_array_read_refcount(&uri), Some(1));

    sm.array_close_for_writes(&uri).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn many_threads_open_and_close_without_leaks() {
    let dir = tempfile::tempdir().unwrap();
    let sm = Arc::new(StorageManager::new(Config::new()).unwrap());
    let uri = create_array(&sm, &dir);
    write_dense(&sm, &uri, &[1, 2, 3, 4], 1_000);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sm = Arc::clone(&sm);
            let uri = uri.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    sm.array_open_for_reads(&uri, u64::MAX, &EncryptionKey::Unencrypted)
                        .unwrap();
                    sm.array_close_for_reads(&uri).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(sm.open_array_read_refcount(&uri), None);
    assert_eq!(sm.queries_in_progress(), 0);
}
