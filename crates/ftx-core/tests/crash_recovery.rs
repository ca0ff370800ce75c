//! Crash recovery correctness.
//!
//! Unclean shutdown is simulated by running the workload in a subprocess
//! that calls `std::process::abort()`, so no `Drop`-time checkpoint or
//! shutdown record is written. The parent then reopens the directory and
//! verifies what recovery reconstructs.

use std::env;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use ftx_core::{Engine, EngineOptions, SnapshotType, XaXid};

const HELPER_MODE_ENV: &str = "FTX_CRASH_HELPER_MODE";
const HELPER_DIR_ENV: &str = "FTX_CRASH_HELPER_DIR";
const HELPER_TEST_NAME: &str = "crash_helper_entrypoint";

fn manual_options() -> EngineOptions {
    EngineOptions {
        checkpoint_period: Duration::ZERO,
        ..EngineOptions::default()
    }
}

fn spawn_crash_helper(mode: &str, dir: &Path) {
    let status = Command::new(env::current_exe().expect("current_exe"))
        .arg("--exact")
        .arg(HELPER_TEST_NAME)
        .arg("--ignored")
        .arg("--nocapture")
        .env(HELPER_MODE_ENV, mode)
        .env(HELPER_DIR_ENV, dir.as_os_str())
        .status()
        .expect("spawn crash helper");
    assert!(!status.success(), "helper must abort for mode={mode}");
}

fn helper_mode_committed(dir: &Path) -> ! {
    let engine = Engine::open(dir, &manual_options()).expect("open helper engine");
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    let txn = engine.txn_begin(None, SnapshotType::None).unwrap();
    for i in 0..50_u32 {
        engine
            .insert(&txn, &dict, &i.to_be_bytes(), b"value")
            .unwrap();
    }
    engine.txn_commit(&txn, false).unwrap();
    // No close: the commit fsync is the only durability point.
    std::process::abort();
}

fn helper_mode_uncommitted(dir: &Path) -> ! {
    let engine = Engine::open(dir, &manual_options()).expect("open helper engine");
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    let txn = engine.txn_begin(None, SnapshotType::None).unwrap();
    engine.insert(&txn, &dict, b"foo", b"bar").unwrap();
    // Force the xbegin and enq_insert onto disk so recovery really has
    // to replay and then abort them.
    engine.fsync_log().unwrap();
    std::process::abort();
}

fn helper_mode_prepared(dir: &Path) -> ! {
    let engine = Engine::open(dir, &manual_options()).expect("open helper engine");
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    let txn = engine.txn_begin(None, SnapshotType::None).unwrap();
    engine.insert(&txn, &dict, b"p", b"q").unwrap();
    let xa = XaXid::new(77, b"global-1", b"branch-1");
    engine.txn_prepare(&txn, &xa).unwrap();
    std::process::abort();
}

fn helper_mode_incomplete_checkpoint(dir: &Path) -> ! {
    use ftx_log::LogRecord;
    use ftx_types::{Lsn, Txnid};

    let engine = Engine::open(dir, &manual_options()).expect("open helper engine");
    let setup = engine.txn_begin(None, SnapshotType::None).unwrap();
    let dict = engine.create_dictionary(&setup, "t.data").unwrap();
    engine.insert(&setup, &dict, b"k", b"v").unwrap();
    engine.txn_commit(&setup, false).unwrap();

    // A checkpoint that began but never ended: its begin record is the
    // last thing in the log.
    engine
        .logger()
        .log(LogRecord::BeginCheckpoint {
            lsn: Lsn::ZERO,
            timestamp: 0,
            last_xid: Txnid(1_000),
        })
        .unwrap();
    engine.fsync_log().unwrap();
    std::process::abort();
}

/// Dispatcher the parent tests spawn; not a test on its own.
#[test]
#[ignore]
fn crash_helper_entrypoint() {
    let mode = env::var(HELPER_MODE_ENV).expect("helper mode");
    let dir = env::var(HELPER_DIR_ENV).expect("helper dir");
    let dir = Path::new(&dir);
    match mode.as_str() {
        "committed" => helper_mode_committed(dir),
        "uncommitted" => helper_mode_uncommitted(dir),
        "prepared" => helper_mode_prepared(dir),
        "incomplete_checkpoint" => helper_mode_incomplete_checkpoint(dir),
        other => panic!("unknown helper mode {other}"),
    }
}

#[test]
fn committed_transaction_survives_crash() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("committed", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let dict = engine.open_dictionary("t.data").unwrap();
    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    for i in 0..50_u32 {
        assert_eq!(
            engine.get(&reader, &dict, &i.to_be_bytes()).unwrap(),
            Some(b"value".to_vec()),
            "committed key {i} must survive the crash"
        );
    }
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn uncommitted_transaction_is_discarded_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("uncommitted", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let dict = engine.open_dictionary("t.data").unwrap();
    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    assert_eq!(
        engine.get(&reader, &dict, b"foo").unwrap(),
        None,
        "uncommitted write must be aborted by recovery"
    );
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn prepared_transaction_survives_crash_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("prepared", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let mut prepared = engine.recover_root_txns(true, 8);
    assert_eq!(prepared.len(), 1, "exactly one prepared txn expected");
    let (xa, txn) = prepared.pop().unwrap();
    assert_eq!(xa.format_id, 77);
    assert_eq!(xa.payload(), b"global-1branch-1");

    engine.txn_commit(&txn, false).unwrap();

    let dict = engine.open_dictionary("t.data").unwrap();
    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    assert_eq!(
        engine.get(&reader, &dict, b"p").unwrap(),
        Some(b"q".to_vec()),
        "prepared txn's write must be durable after its commit"
    );
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn prepared_transaction_can_be_aborted_after_recovery() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("prepared", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    // Reopen the dictionary first so the abort can reach its versions.
    let dict = engine.open_dictionary("t.data").unwrap();
    let mut prepared = engine.recover_root_txns(true, 8);
    assert_eq!(prepared.len(), 1);
    let (_, txn) = prepared.pop().unwrap();
    engine.txn_abort(&txn).unwrap();

    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    let value = engine.get(&reader, &dict, b"p").unwrap();
    assert_eq!(value, None, "aborted prepared txn leaves nothing behind");
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn recovery_discards_trailing_incomplete_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("incomplete_checkpoint", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let dict = engine.open_dictionary("t.data").unwrap();
    let reader = engine.txn_begin(None, SnapshotType::None).unwrap();
    assert_eq!(
        engine.get(&reader, &dict, b"k").unwrap(),
        Some(b"v".to_vec()),
        "data must survive a crash mid-checkpoint"
    );
    engine.txn_commit(&reader, false).unwrap();
    engine.close().unwrap();
}

#[test]
fn xa_recovery_cursor_returns_short_result_at_end() {
    let dir = tempfile::tempdir().unwrap();
    spawn_crash_helper("prepared", dir.path());

    let engine = Engine::open(dir.path(), &manual_options()).unwrap();
    let first = engine.recover_root_txns(true, 8);
    assert_eq!(first.len(), 1);
    let next = engine.recover_root_txns(false, 8);
    assert!(next.is_empty(), "cursor must be exhausted");

    // Resolve the prepared txn so close succeeds.
    let (_, txn) = engine.recover_root_txns(true, 1).pop().unwrap();
    engine.txn_commit(&txn, false).unwrap();
    engine.close().unwrap();
}
