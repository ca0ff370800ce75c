//! Scan-state machine behavior on synthetic logs: turnaround at the last
//! complete checkpoint, corruption on malformed checkpoint pairs, and the
//! shape of the finalization tail.

use std::path::Path;
use std::sync::Arc;

use ftx_cachetable::Cachetable;
use ftx_error::Result;
use ftx_log::{DEFAULT_LG_MAX, LogCursor, LogRecord, LogWriter};
use ftx_recover::{RecoveryHandler, needs_recovery, recover};
use ftx_txn::{Logger, LoggerOptions, OpenDictionary, RollbackTarget, Txn, TxnManager};
use ftx_types::{Filenum, Lsn, Txnid, Xids};

// ---------------------------------------------------------------------------
// A handler that applies nothing
// ---------------------------------------------------------------------------

struct NoopTarget;

impl RollbackTarget for NoopTarget {
    fn undo_insert(&self, _: Filenum, _: &[u8], _: &Xids, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn undo_delete(&self, _: Filenum, _: &[u8], _: &Xids, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn undo_update(&self, _: Filenum, _: &[u8], _: &Xids, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn undo_update_broadcast(&self, _: Filenum, _: &Xids, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn commit_file_delete(&self, _: Filenum, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn abort_file_create(&self, _: Filenum, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn abort_file_rename(&self, _: Filenum, _: &[u8], _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn commit_load(&self, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn abort_load(&self, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn abort_change_descriptor(&self, _: Filenum, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
}

struct NoopHandler {
    target: NoopTarget,
}

impl RecoveryHandler for NoopHandler {
    fn open_dictionary(&self, _: &[u8], _: Filenum, _: bool, _: bool) -> Result<bool> {
        Ok(false)
    }
    fn dictionary_handle(&self, _: Filenum) -> Option<Arc<dyn OpenDictionary>> {
        None
    }
    fn close_all_dictionaries(&self, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_insert(
        &self,
        _: &Arc<Txn>,
        _: Filenum,
        _: &Xids,
        _: &[u8],
        _: &[u8],
        _: bool,
        _: Lsn,
    ) -> Result<()> {
        Ok(())
    }
    fn redo_delete(&self, _: &Arc<Txn>, _: Filenum, _: &Xids, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_update(
        &self,
        _: &Arc<Txn>,
        _: Filenum,
        _: &Xids,
        _: &[u8],
        _: &[u8],
        _: Lsn,
    ) -> Result<()> {
        Ok(())
    }
    fn redo_update_broadcast(
        &self,
        _: &Arc<Txn>,
        _: Filenum,
        _: &Xids,
        _: &[u8],
        _: bool,
        _: Lsn,
    ) -> Result<()> {
        Ok(())
    }
    fn redo_fcreate(&self, _: &Arc<Txn>, _: Filenum, _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_fdelete(&self, _: &Arc<Txn>, _: Filenum, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_fclose(&self, _: &[u8], _: Filenum, _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_change_fdescriptor(
        &self,
        _: &Arc<Txn>,
        _: Filenum,
        _: &[u8],
        _: &[u8],
        _: bool,
        _: Lsn,
    ) -> Result<()> {
        Ok(())
    }
    fn redo_suppress_rollback(&self, _: &Arc<Txn>, _: Filenum) -> Result<()> {
        Ok(())
    }
    fn redo_load(&self, _: &Arc<Txn>, _: &[u8], _: &[u8], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn redo_hot_index(&self, _: &Arc<Txn>, _: &[Filenum], _: Lsn) -> Result<()> {
        Ok(())
    }
    fn rollback_target(&self) -> &dyn RollbackTarget {
        &self.target
    }
    fn prepared_txn(&self, _: &Arc<Txn>) {}
    fn recovery_checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log construction helpers
// ---------------------------------------------------------------------------

fn begin_checkpoint(last_xid: u64) -> LogRecord {
    LogRecord::BeginCheckpoint {
        lsn: Lsn::ZERO,
        timestamp: 1,
        last_xid: Txnid(last_xid),
    }
}

fn end_checkpoint(begin: u64) -> LogRecord {
    LogRecord::EndCheckpoint {
        lsn: Lsn::ZERO,
        lsn_begin_checkpoint: Lsn(begin),
        timestamp: 2,
        num_fassociate_entries: 0,
        num_xstillopen_entries: 0,
    }
}

fn write_log(dir: &Path, records: Vec<LogRecord>) {
    let writer = LogWriter::open(dir, DEFAULT_LG_MAX).unwrap();
    for record in records {
        writer.append(record).unwrap();
    }
    writer.fsync().unwrap();
}

fn run_recovery(dir: &Path) -> Result<Logger> {
    let manager = Arc::new(TxnManager::new());
    let logger = Logger::open(dir, manager, &LoggerOptions::default())?;
    let cachetable = Cachetable::new(dir.to_path_buf());
    let handler = NoopHandler { target: NoopTarget };
    recover(&logger, &cachetable, &handler, dir, None, None)?;
    Ok(logger)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_minimal_complete_checkpoint_recovers() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path(), vec![begin_checkpoint(5), end_checkpoint(1)]);
    assert!(needs_recovery(dir.path(), true).unwrap());

    let logger = run_recovery(dir.path()).unwrap();
    // The checkpoint's id counter was adopted.
    assert_eq!(logger.txn_manager().last_xid(), Txnid(5));

    // Finalization appended the recover comment past the old tail.
    let mut cursor = LogCursor::create(dir.path()).unwrap();
    let last = cursor.last().unwrap().unwrap();
    match last {
        LogRecord::Comment { comment, lsn, .. } => {
            assert_eq!(comment, b"recover");
            assert_eq!(lsn, Lsn(3));
        }
        other => panic!("expected trailing comment, got {}", other.cmd_name()),
    }
}

#[test]
fn test_trailing_incomplete_checkpoint_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    write_log(
        dir.path(),
        vec![
            begin_checkpoint(5),
            end_checkpoint(1),
            // A later checkpoint that never ended.
            begin_checkpoint(9),
        ],
    );
    let logger = run_recovery(dir.path()).unwrap();
    // The turnaround used the complete pair; the incomplete one only
    // feeds the id counter check.
    assert_eq!(logger.txn_manager().last_xid(), Txnid(5));
}

#[test]
fn test_double_end_checkpoint_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    write_log(
        dir.path(),
        vec![begin_checkpoint(5), end_checkpoint(1), end_checkpoint(1)],
    );
    let err = run_recovery(dir.path()).unwrap_err();
    assert!(err.is_corruption(), "got {err}");
}

#[test]
fn test_end_checkpoint_with_wrong_begin_lsn_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    // end_checkpoint claims its begin is at LSN 1, but LSN 1 is a
    // comment.
    write_log(
        dir.path(),
        vec![
            LogRecord::Comment {
                lsn: Lsn::ZERO,
                timestamp: 0,
                comment: b"x".to_vec(),
            },
            begin_checkpoint(5),
            end_checkpoint(1),
        ],
    );
    let err = run_recovery(dir.path()).unwrap_err();
    assert!(err.is_corruption(), "got {err}");
}

#[test]
fn test_no_complete_checkpoint_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path(), vec![begin_checkpoint(5)]);
    let err = run_recovery(dir.path()).unwrap_err();
    assert!(err.is_corruption(), "got {err}");
}

#[test]
fn test_live_txn_reconstructed_and_aborted() {
    let dir = tempfile::tempdir().unwrap();
    write_log(
        dir.path(),
        vec![
            begin_checkpoint(5),
            end_checkpoint(1),
            LogRecord::Xbegin {
                lsn: Lsn::ZERO,
                xid: ftx_types::TxnidPair::root(Txnid(6)),
                parent_xid: ftx_types::TxnidPair::NONE,
            },
        ],
    );
    let logger = run_recovery(dir.path()).unwrap();
    // The transaction was created at its replayed id, then aborted by
    // finalization; nothing survives.
    assert_eq!(logger.txn_manager().num_live_root_txns(), 0);
    assert!(logger.txn_manager().last_xid() >= Txnid(6));

    // The abort was logged after the restart.
    let mut cursor = LogCursor::create(dir.path()).unwrap();
    let mut saw_abort = false;
    let mut record = cursor.first().unwrap();
    while let Some(r) = record {
        if let LogRecord::Xabort { xid, .. } = r {
            assert_eq!(xid.parent_id64, Txnid(6));
            saw_abort = true;
        }
        record = cursor.next().unwrap();
    }
    assert!(saw_abort, "finalization must log the abort");
}
