//! Lifecycle tests that drive real rollback chains through a real logger
//! and cachetable: spill behavior, abort ordering, nested promotion, and
//! the read-only fast path.

use std::sync::Arc;

use parking_lot::Mutex;

use ftx_cachetable::Cachetable;
use ftx_error::Result;
use ftx_txn::rollback::{RollEntry, save_rollback};
use ftx_txn::{
    Logger, LoggerOptions, RollbackTarget, Txn, TxnManager, abort_txn_with_lsn,
    commit_txn_with_lsn, complete_txn, prepare_txn,
};
use ftx_types::{Filenum, Lsn, SnapshotType, TxnState, XaXid, Xids};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    _tmp: tempfile::TempDir,
    _cachetable: Cachetable,
    manager: Arc<TxnManager>,
    logger: Logger,
}

fn fixture() -> Fixture {
    fixture_with_spill(ftx_txn::rollback::DEFAULT_ROLLBACK_SPILL_THRESHOLD)
}

fn fixture_with_spill(spill: u64) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let cachetable = Cachetable::new(tmp.path().to_path_buf());
    let manager = Arc::new(TxnManager::new());
    let logger = Logger::open(
        &tmp.path().join("logs"),
        Arc::clone(&manager),
        &LoggerOptions {
            rollback_spill_threshold: spill,
            ..LoggerOptions::default()
        },
    )
    .unwrap();
    logger
        .open_rollback_cachefile(&cachetable, None, Lsn::MAX)
        .unwrap();
    Fixture {
        _tmp: tmp,
        _cachetable: cachetable,
        manager,
        logger,
    }
}

/// Records every undo call, so tests can assert order and content.
#[derive(Default)]
struct RecordingTarget {
    undone: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTarget {
    fn undone(&self) -> Vec<(String, Vec<u8>)> {
        self.undone.lock().clone()
    }
}

impl RollbackTarget for RecordingTarget {
    fn undo_insert(&self, _f: Filenum, key: &[u8], _x: &Xids, _l: Lsn) -> Result<()> {
        self.undone.lock().push(("insert".into(), key.to_vec()));
        Ok(())
    }
    fn undo_delete(&self, _f: Filenum, key: &[u8], _x: &Xids, _l: Lsn) -> Result<()> {
        self.undone.lock().push(("delete".into(), key.to_vec()));
        Ok(())
    }
    fn undo_update(&self, _f: Filenum, key: &[u8], _x: &Xids, _l: Lsn) -> Result<()> {
        self.undone.lock().push(("update".into(), key.to_vec()));
        Ok(())
    }
    fn undo_update_broadcast(&self, _f: Filenum, _x: &Xids, _l: Lsn) -> Result<()> {
        self.undone.lock().push(("broadcast".into(), Vec::new()));
        Ok(())
    }
    fn commit_file_delete(&self, _f: Filenum, iname: &[u8], _l: Lsn) -> Result<()> {
        self.undone
            .lock()
            .push(("commit_fdelete".into(), iname.to_vec()));
        Ok(())
    }
    fn abort_file_create(&self, _f: Filenum, iname: &[u8], _l: Lsn) -> Result<()> {
        self.undone
            .lock()
            .push(("abort_fcreate".into(), iname.to_vec()));
        Ok(())
    }
    fn abort_file_rename(&self, _f: Filenum, old: &[u8], _new: &[u8], _l: Lsn) -> Result<()> {
        self.undone.lock().push(("abort_rename".into(), old.to_vec()));
        Ok(())
    }
    fn commit_load(&self, old: &[u8], _l: Lsn) -> Result<()> {
        self.undone.lock().push(("commit_load".into(), old.to_vec()));
        Ok(())
    }
    fn abort_load(&self, new: &[u8], _l: Lsn) -> Result<()> {
        self.undone.lock().push(("abort_load".into(), new.to_vec()));
        Ok(())
    }
    fn abort_change_descriptor(&self, _f: Filenum, old: &[u8], _l: Lsn) -> Result<()> {
        self.undone.lock().push(("abort_desc".into(), old.to_vec()));
        Ok(())
    }
}

fn begin_root(fx: &Fixture) -> Arc<Txn> {
    fx.manager
        .start_txn(None, SnapshotType::None, false, None)
        .unwrap()
}

fn write_key(fx: &Fixture, txn: &Arc<Txn>, key: &[u8]) {
    txn.maybe_log_begin_for_write_operation(&fx.logger).unwrap();
    save_rollback(
        txn,
        &fx.logger,
        RollEntry::Insert {
            filenum: Filenum(9),
            key: key.to_vec(),
        },
    )
    .unwrap();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_abort_undoes_in_reverse_order() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);

    for key in [b"a".as_slice(), b"b", b"c"] {
        write_key(&fx, &txn, key);
    }
    abort_txn_with_lsn(&txn, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    let undone = target.undone();
    let keys: Vec<&[u8]> = undone.iter().map(|(_, k)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"c".as_slice(), b"b", b"a"]);
    assert_eq!(txn.state(), TxnState::Retired);
}

#[test]
fn test_spilled_chain_walks_to_head() {
    // A tiny threshold forces a spill after every entry.
    let fx = fixture_with_spill(1);
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);

    let n = 10_u8;
    for i in 0..n {
        write_key(&fx, &txn, &[i]);
    }
    {
        let inner = txn.inner();
        assert!(inner.roll.has_spilled(), "expected spilled chain");
        assert!(inner.roll.num_rollback_nodes >= 2);
    }
    abort_txn_with_lsn(&txn, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    let undone = target.undone();
    assert_eq!(undone.len(), n as usize);
    let keys: Vec<u8> = undone.iter().map(|(_, k)| k[0]).collect();
    let expected: Vec<u8> = (0..n).rev().collect();
    assert_eq!(keys, expected, "undo must run newest to oldest");
}

#[test]
fn test_commit_leaves_writes_alone() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    write_key(&fx, &txn, b"kept");
    commit_txn_with_lsn(&txn, &fx.logger, &target, false, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    assert!(target.undone().is_empty(), "commit must not undo writes");
    let (do_fsync, lsn) = txn.fsync_info();
    assert!(do_fsync, "writing txn commit requires fsync");
    assert!(!lsn.is_zero());
}

#[test]
fn test_read_only_txn_closes_without_records() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let before = fx.logger.writer().last_lsn();

    let txn = begin_root(&fx);
    assert!(txn.is_read_only());
    commit_txn_with_lsn(&txn, &fx.logger, &target, false, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    let (do_fsync, lsn) = txn.fsync_info();
    assert!(!do_fsync, "read-only commit must not fsync");
    assert!(lsn.is_zero());
    assert_eq!(
        fx.logger.writer().last_lsn(),
        before,
        "read-only txn must write no log records"
    );
}

#[test]
fn test_nosync_commit_skips_fsync() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    write_key(&fx, &txn, b"x");
    commit_txn_with_lsn(&txn, &fx.logger, &target, true, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();
    let (do_fsync, _) = txn.fsync_info();
    assert!(!do_fsync);
}

#[test]
fn test_force_fsync_overrides_nosync() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    txn.set_force_fsync_on_commit();
    write_key(&fx, &txn, b"x");
    commit_txn_with_lsn(&txn, &fx.logger, &target, true, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();
    let (do_fsync, _) = txn.fsync_info();
    assert!(do_fsync);
}

#[test]
fn test_prepared_commit_skips_fsync() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    write_key(&fx, &txn, b"x");

    let xa = XaXid::new(1, b"gtrid", b"bq");
    prepare_txn(&txn, &fx.logger, &xa).unwrap();
    assert_eq!(txn.state(), TxnState::Preparing);
    let (do_fsync, _) = txn.fsync_info();
    assert!(do_fsync, "prepare itself fsyncs");

    commit_txn_with_lsn(&txn, &fx.logger, &target, false, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();
    let (do_fsync, _) = txn.fsync_info();
    assert!(!do_fsync, "prepare already made the log durable");
}

#[test]
fn test_prepare_child_is_noop() {
    let fx = fixture();
    let root = begin_root(&fx);
    let child = fx
        .manager
        .start_txn(Some(Arc::clone(&root)), SnapshotType::None, false, None)
        .unwrap();
    write_key(&fx, &child, b"c");
    let xa = XaXid::new(1, b"g", b"b");
    prepare_txn(&child, &fx.logger, &xa).unwrap();
    assert_eq!(child.state(), TxnState::Live, "children cannot prepare");
}

#[test]
fn test_child_commit_promotes_then_root_abort_undoes() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let root = begin_root(&fx);
    let child = fx
        .manager
        .start_txn(Some(Arc::clone(&root)), SnapshotType::None, false, None)
        .unwrap();

    write_key(&fx, &child, b"c1");
    write_key(&fx, &child, b"c2");
    commit_txn_with_lsn(&child, &fx.logger, &target, false, Lsn::ZERO, None).unwrap();
    complete_txn(&child, &fx.logger).unwrap();
    assert!(target.undone().is_empty());

    // The parent inherited the child's undo entries.
    assert_eq!(root.inner().roll.num_rollentries, 2);

    abort_txn_with_lsn(&root, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&root, &fx.logger).unwrap();
    let undone = target.undone();
    let keys: Vec<Vec<u8>> = undone.iter().map(|(_, k)| k.clone()).collect();
    assert_eq!(keys, vec![b"c2".to_vec(), b"c1".to_vec()]);
}

#[test]
fn test_child_spilled_chain_promoted_as_rollinclude() {
    let fx = fixture_with_spill(1);
    let target = RecordingTarget::default();
    let root = begin_root(&fx);
    let child = fx
        .manager
        .start_txn(Some(Arc::clone(&root)), SnapshotType::None, false, None)
        .unwrap();

    for i in 0..6_u8 {
        write_key(&fx, &child, &[i]);
    }
    assert!(child.inner().roll.has_spilled());
    commit_txn_with_lsn(&child, &fx.logger, &target, false, Lsn::ZERO, None).unwrap();
    complete_txn(&child, &fx.logger).unwrap();

    // Root abort must reach through the rollinclude into the child's
    // spilled nodes and undo everything, newest first.
    abort_txn_with_lsn(&root, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&root, &fx.logger).unwrap();
    let keys: Vec<u8> = target.undone().iter().map(|(_, k)| k[0]).collect();
    let expected: Vec<u8> = (0..6_u8).rev().collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_rollback_nodes_freed_after_apply() {
    let fx = fixture_with_spill(1);
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    for i in 0..5_u8 {
        write_key(&fx, &txn, &[i]);
    }
    abort_txn_with_lsn(&txn, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    let cf = fx.logger.rollback_cachefile().unwrap();
    assert!(
        cf.live_blocknums().is_empty(),
        "all rollback nodes must be freed after apply"
    );
}

#[test]
fn test_xbegin_logged_lazily_and_once() {
    let fx = fixture();
    let txn = begin_root(&fx);
    let before = fx.logger.writer().last_lsn();
    write_key(&fx, &txn, b"a");
    let after_first = fx.logger.writer().last_lsn();
    assert_eq!(after_first.get(), before.get() + 1, "one xbegin record");
    write_key(&fx, &txn, b"b");
    assert_eq!(
        fx.logger.writer().last_lsn(),
        after_first,
        "xbegin is logged once"
    );

    let target = RecordingTarget::default();
    abort_txn_with_lsn(&txn, &fx.logger, &target, Lsn::ZERO, None).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();
}

#[test]
fn test_progress_poll_fires_every_1024_entries() {
    let fx = fixture();
    let target = RecordingTarget::default();
    let txn = begin_root(&fx);
    for i in 0..2100_u32 {
        write_key(&fx, &txn, &i.to_be_bytes());
    }
    let polls = Mutex::new(Vec::new());
    let poll = |p: &ftx_txn::TxnProgress| {
        polls.lock().push((p.entries_processed, p.is_commit));
    };
    abort_txn_with_lsn(&txn, &fx.logger, &target, Lsn::ZERO, Some(&poll)).unwrap();
    complete_txn(&txn, &fx.logger).unwrap();

    let seen = polls.lock().clone();
    assert_eq!(seen.len(), 2, "2100 entries cross the 1024 boundary twice");
    assert_eq!(seen[0].0, 1024);
    assert_eq!(seen[1].0, 2048);
    assert!(!seen[0].1, "abort reports is_commit=false");
}
