//! MVCC bookkeeping through the engine: referenced-XID tuples across
//! real commits, the GC state clone, and version collapse in the
//! dictionary.

use std::time::Duration;

use ftx_core::{Engine, EngineOptions, SnapshotType};
use ftx_types::Txnid;

fn manual_options() -> EngineOptions {
    EngineOptions {
        checkpoint_period: Duration::ZERO,
        ..EngineOptions::default()
    }
}

#[test]
fn committed_writer_referenced_by_snapshot_gets_tuple() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    // Writer is live when the snapshot reader starts; the reader's live
    // list pins it after commit.
    let writer = engine.txn_begin(None, SnapshotType::None).unwrap();
    engine.insert(&writer, &dict, b"k", b"v").unwrap();
    let reader = engine.txn_begin(None, SnapshotType::Root).unwrap();
    engine.txn_commit(&writer, false).unwrap();

    let gc = engine.txn_manager().clone_state_for_gc();
    assert_eq!(gc.referenced_xids.len(), 1);
    let tuple = gc.referenced_xids[0];
    assert_eq!(tuple.begin_id, writer.root_txnid());
    assert!(tuple.begin_id < tuple.end_id);
    assert_eq!(tuple.references, 1);
    assert_eq!(
        gc.youngest_live_list_txnid_for(writer.root_txnid()),
        reader.snapshot_txnid()
    );

    // While the tuple lives, the writer's version is invisible to the
    // reader but the key is readable by everyone else.
    assert_eq!(engine.get(&reader, &dict, b"k").unwrap(), None);

    engine.txn_commit(&reader, false).unwrap();
    let gc = engine.txn_manager().clone_state_for_gc();
    assert!(
        gc.referenced_xids.is_empty(),
        "tuple must die with its last referencing snapshot"
    );
    engine.close().unwrap();
}

#[test]
fn tuple_reference_counts_across_multiple_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    let writer = engine.txn_begin(None, SnapshotType::None).unwrap();
    engine.insert(&writer, &dict, b"k", b"v").unwrap();
    let r1 = engine.txn_begin(None, SnapshotType::Root).unwrap();
    let r2 = engine.txn_begin(None, SnapshotType::Root).unwrap();
    engine.txn_commit(&writer, false).unwrap();

    let gc = engine.txn_manager().clone_state_for_gc();
    assert_eq!(gc.referenced_xids[0].references, 2);

    engine.txn_commit(&r1, false).unwrap();
    let gc = engine.txn_manager().clone_state_for_gc();
    assert_eq!(gc.referenced_xids[0].references, 1);

    engine.txn_commit(&r2, false).unwrap();
    assert!(engine.txn_manager().clone_state_for_gc().referenced_xids.is_empty());
    engine.close().unwrap();
}

#[test]
fn oldest_referenced_xid_estimate_covers_live_and_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), &manual_options()).unwrap();

    let old = engine.txn_begin(None, SnapshotType::None).unwrap();
    let _mid = engine.txn_begin(None, SnapshotType::Root).unwrap();
    let young = engine.txn_begin(None, SnapshotType::None).unwrap();

    let estimate = engine.txn_manager().oldest_referenced_xid_estimate();
    assert!(estimate <= old.root_txnid());
    assert!(estimate < young.root_txnid());

    engine.txn_commit(&old, false).unwrap();
    engine.txn_commit(&_mid, false).unwrap();
    engine.txn_commit(&young, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn dictionary_gc_collapses_obsolete_versions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    // Three committed generations of the same key.
    for value in [b"v1".as_slice(), b"v2", b"v3"] {
        let txn = engine.txn_begin(None, SnapshotType::None).unwrap();
        engine.insert(&txn, &dict, b"k", value).unwrap();
        engine.txn_commit(&txn, false).unwrap();
    }

    // No readers: everything older than the newest committed version is
    // collectible.
    let oldest = engine.txn_manager().oldest_referenced_xid_estimate();
    dict.simple_gc(oldest).unwrap();

    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    assert_eq!(
        engine.get(&reader, &dict, b"k").unwrap(),
        Some(b"v3".to_vec()),
        "the newest committed version survives GC"
    );
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn snapshot_live_lists_are_exact() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), &manual_options()).unwrap();

    let a = engine.txn_begin(None, SnapshotType::None).unwrap();
    let b = engine.txn_begin(None, SnapshotType::None).unwrap();
    let snap = engine.txn_begin(None, SnapshotType::Root).unwrap();

    let list = snap.live_root_txn_list().unwrap();
    let expect: Vec<Txnid> = vec![a.root_txnid(), b.root_txnid(), snap.root_txnid()];
    assert_eq!(**list, expect, "live list holds every live root, itself included");

    engine.txn_commit(&a, false).unwrap();
    engine.txn_commit(&b, false).unwrap();
    engine.txn_commit(&snap, false).unwrap();
    engine.close().unwrap();
}
