//! Crash recovery.
//!
//! Triggered when the log's last record is not a clean `shutdown`. The
//! scan runs backward from the tail to the last complete checkpoint's
//! `begin_checkpoint`, turns around, and replays forward: the checkpoint
//! interior re-registers open files (`fassociate`) and in-flight
//! transactions (`xstillopen`), and the post-checkpoint region re-applies
//! every redo record, gated by each dictionary's max-applied LSN.
//! Finalization aborts the unprepared survivors in descending txnid
//! order, hands prepared transactions to the embedder, and forces a
//! recovery checkpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fs4::FileExt;
use tracing::{error, info};

use ftx_cachetable::Cachetable;
use ftx_error::{FtxError, Result};
use ftx_log::{LogCursor, LogRecord};
use ftx_txn::rollback::ROLLBACK_CACHEFILE_NAME;
use ftx_txn::{
    Logger, OpenDictionary, RollbackTarget, Txn, TxnInfo, abort_txn_with_lsn,
    commit_txn_with_lsn, complete_txn, prepare_txn,
};
use ftx_types::{Filenum, Lsn, SnapshotType, Txnid, TxnidPair, TxnState, XaXid, Xids};

/// Lock file serializing recovery within a log directory.
pub const RECOVERY_LOCK_FILE_NAME: &str = "__tokudb_recoverylock_dont_delete_me";

/// Seconds between recovery progress reports.
const PROGRESS_REPORT_SECS: u64 = 15;
/// Records between progress checks.
const PROGRESS_CHECK_PERIOD: u64 = 1000;

// ---------------------------------------------------------------------------
// Embedder capabilities
// ---------------------------------------------------------------------------

/// The index-layer operations recovery needs. Implemented by the engine;
/// every redo must gate on the dictionary's max-applied LSN so replaying a
/// prefix twice equals replaying it once.
pub trait RecoveryHandler: Send + Sync {
    /// Open the dictionary `iname` bound to `filenum`. A missing file is
    /// not an error (`Ok(false)`) unless `create` is set, in which case
    /// the file is created empty.
    fn open_dictionary(
        &self,
        iname: &[u8],
        filenum: Filenum,
        create: bool,
        unlink_on_close: bool,
    ) -> Result<bool>;

    /// Handle for a dictionary opened earlier in this replay.
    fn dictionary_handle(&self, filenum: Filenum) -> Option<Arc<dyn OpenDictionary>>;

    /// Close every dictionary opened during replay.
    fn close_all_dictionaries(&self, oplsn: Lsn) -> Result<()>;

    fn redo_insert(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        value: &[u8],
        no_overwrite: bool,
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_delete(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_update(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        extra: &[u8],
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_update_broadcast(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        extra: &[u8],
        is_resetting: bool,
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_fcreate(&self, txn: &Arc<Txn>, filenum: Filenum, iname: &[u8], lsn: Lsn)
    -> Result<()>;
    fn redo_fdelete(&self, txn: &Arc<Txn>, filenum: Filenum, lsn: Lsn) -> Result<()>;
    fn redo_fclose(&self, iname: &[u8], filenum: Filenum, lsn: Lsn) -> Result<()>;
    fn redo_change_fdescriptor(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        old_descriptor: &[u8],
        new_descriptor: &[u8],
        update_cmp_descriptor: bool,
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_suppress_rollback(&self, txn: &Arc<Txn>, filenum: Filenum) -> Result<()>;
    fn redo_load(
        &self,
        txn: &Arc<Txn>,
        old_iname: &[u8],
        new_iname: &[u8],
        lsn: Lsn,
    ) -> Result<()>;
    fn redo_hot_index(&self, txn: &Arc<Txn>, filenums: &[Filenum], lsn: Lsn) -> Result<()>;

    /// Target for commit/abort application during replay and finalization.
    fn rollback_target(&self) -> &dyn RollbackTarget;

    /// A prepared transaction survived recovery; the layer above decides
    /// its fate (commit or abort, possibly much later).
    fn prepared_txn(&self, txn: &Arc<Txn>);

    /// Force the post-recovery checkpoint.
    fn recovery_checkpoint(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Recovery lock
// ---------------------------------------------------------------------------

/// Exclusive lock on the log directory for the duration of recovery.
/// Released on drop.
#[derive(Debug)]
pub struct RecoveryLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RecoveryLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecoveryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Take the recovery lock, refusing if another process holds it.
pub fn recover_lock(log_dir: &Path) -> Result<RecoveryLock> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(RECOVERY_LOCK_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    if file.try_lock_exclusive().is_err() {
        error!(path = %path.display(), "another process holds the recovery lock");
        return Err(FtxError::RecoveryLockHeld(path.display().to_string()));
    }
    Ok(RecoveryLock { file, path })
}

// ---------------------------------------------------------------------------
// Needs-recovery test
// ---------------------------------------------------------------------------

/// Whether the log requires recovery: true unless it ends in a clean
/// `shutdown`, or is entirely absent and `ignore_empty` is set.
pub fn needs_recovery(log_dir: &Path, ignore_empty: bool) -> Result<bool> {
    let mut cursor = match LogCursor::create(log_dir) {
        Ok(c) => c,
        Err(_) => return Ok(true),
    };
    match cursor.last() {
        Ok(Some(record)) => Ok(!record.is_clean_shutdown()),
        Ok(None) => Ok(!ignore_empty),
        Err(_) => Ok(true),
    }
}

// ---------------------------------------------------------------------------
// Scan state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanDirection {
    BackwardNewerCheckpointEnd,
    BackwardBetweenCheckpointBeginEnd,
    ForwardBetweenCheckpointBeginEnd,
    ForwardNewerCheckpointEnd,
}

impl ScanDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::BackwardNewerCheckpointEnd => "bw_newer",
            Self::BackwardBetweenCheckpointBeginEnd => "bw_between",
            Self::ForwardBetweenCheckpointBeginEnd => "fw_between",
            Self::ForwardNewerCheckpointEnd => "fw_newer",
        }
    }
}

struct ScanState {
    direction: ScanDirection,
    checkpoint_begin_lsn: Lsn,
    checkpoint_end_lsn: Lsn,
    checkpoint_begin_timestamp: u64,
    checkpoint_end_timestamp: u64,
    num_fassociate: u32,
    num_xstillopen: u32,
    last_xid: Txnid,
}

impl ScanState {
    fn new() -> Self {
        Self {
            direction: ScanDirection::BackwardNewerCheckpointEnd,
            checkpoint_begin_lsn: Lsn::ZERO,
            checkpoint_end_lsn: Lsn::ZERO,
            checkpoint_begin_timestamp: 0,
            checkpoint_end_timestamp: 0,
            num_fassociate: 0,
            num_xstillopen: 0,
            last_xid: Txnid::NONE,
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery environment
// ---------------------------------------------------------------------------

struct RecoverEnv<'a> {
    logger: &'a Logger,
    cachetable: &'a Cachetable,
    handler: &'a dyn RecoveryHandler,
    ss: ScanState,
    /// filenum → iname of dictionaries opened during this replay.
    fmap: BTreeMap<Filenum, Vec<u8>>,
    goforward: bool,
}

impl RecoverEnv<'_> {
    fn corrupt(&self, msg: impl Into<String>) -> FtxError {
        let msg = msg.into();
        error!(state = self.ss.direction.as_str(), msg, "recovery corruption");
        FtxError::RunRecovery(msg)
    }

    fn find_txn(&self, xid: TxnidPair) -> Result<Arc<Txn>> {
        self.logger
            .txn_manager()
            .id2txn_pair(xid)
            .ok_or_else(|| self.corrupt(format!("log references unknown txn {xid}")))
    }

    fn txn_for_xids(&self, xids: &Xids) -> Result<Arc<Txn>> {
        let pair = if xids.depth() <= 1 {
            TxnidPair::root(xids.outermost())
        } else {
            TxnidPair::child(xids.outermost(), xids.innermost())
        };
        self.find_txn(pair)
    }

    // -----------------------------------------------------------------------
    // Backward handlers
    // -----------------------------------------------------------------------

    fn dispatch_backward(&mut self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::EndCheckpoint {
                lsn,
                lsn_begin_checkpoint,
                timestamp,
                ..
            } => match self.ss.direction {
                ScanDirection::BackwardNewerCheckpointEnd => {
                    info!(
                        lsn = %lsn,
                        begin = %lsn_begin_checkpoint,
                        state = self.ss.direction.as_str(),
                        "recovery bw_end_checkpoint"
                    );
                    self.ss.direction = ScanDirection::BackwardBetweenCheckpointBeginEnd;
                    self.ss.checkpoint_begin_lsn = *lsn_begin_checkpoint;
                    self.ss.checkpoint_end_lsn = *lsn;
                    self.ss.checkpoint_end_timestamp = *timestamp;
                    Ok(())
                }
                ScanDirection::BackwardBetweenCheckpointBeginEnd => Err(self.corrupt(
                    "two end_checkpoint records without an intervening begin_checkpoint",
                )),
                _ => Err(self.corrupt("end_checkpoint in forward state during backward scan")),
            },
            LogRecord::BeginCheckpoint { lsn, timestamp, .. } => match self.ss.direction {
                ScanDirection::BackwardNewerCheckpointEnd => {
                    // Incomplete checkpoint; keep scanning for the last
                    // complete one.
                    info!(lsn = %lsn, "recovery discarding incomplete checkpoint");
                    Ok(())
                }
                ScanDirection::BackwardBetweenCheckpointBeginEnd => {
                    if *lsn != self.ss.checkpoint_begin_lsn {
                        return Err(self.corrupt(format!(
                            "begin_checkpoint at {lsn} does not match end_checkpoint's {}",
                            self.ss.checkpoint_begin_lsn
                        )));
                    }
                    self.ss.direction = ScanDirection::ForwardBetweenCheckpointBeginEnd;
                    self.ss.checkpoint_begin_timestamp = *timestamp;
                    self.goforward = true;
                    info!(
                        lsn = %lsn,
                        checkpoint_secs =
                            self.ss.checkpoint_end_timestamp - self.ss.checkpoint_begin_timestamp,
                        "recovery turning around at begin_checkpoint"
                    );
                    Ok(())
                }
                _ => Err(self.corrupt("begin_checkpoint in forward state during backward scan")),
            },
            // Every other record is a no-op going backward.
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Forward handlers
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn dispatch_forward(&mut self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::BeginCheckpoint { lsn, last_xid, .. } => match self.ss.direction {
                ScanDirection::ForwardBetweenCheckpointBeginEnd => {
                    if *lsn != self.ss.checkpoint_begin_lsn {
                        return Err(self.corrupt("turnaround begin_checkpoint LSN changed"));
                    }
                    self.ss.last_xid = *last_xid;
                    self.logger
                        .txn_manager()
                        .set_last_xid_from_recovered_checkpoint(*last_xid);
                    Ok(())
                }
                ScanDirection::ForwardNewerCheckpointEnd => {
                    // A later (incomplete) checkpoint's begin: ignore it,
                    // but its counter must not run backwards.
                    if *last_xid < self.ss.last_xid {
                        return Err(self.corrupt("begin_checkpoint last_xid regressed"));
                    }
                    Ok(())
                }
                _ => Err(self.corrupt("begin_checkpoint in backward state during forward scan")),
            },
            LogRecord::EndCheckpoint {
                lsn,
                lsn_begin_checkpoint,
                num_fassociate_entries,
                num_xstillopen_entries,
                ..
            } => match self.ss.direction {
                ScanDirection::ForwardBetweenCheckpointBeginEnd => {
                    if *lsn_begin_checkpoint != self.ss.checkpoint_begin_lsn
                        || *lsn != self.ss.checkpoint_end_lsn
                    {
                        return Err(self.corrupt("end_checkpoint does not match turnaround"));
                    }
                    if *num_fassociate_entries != self.ss.num_fassociate
                        || *num_xstillopen_entries != self.ss.num_xstillopen
                    {
                        return Err(self.corrupt(format!(
                            "checkpoint interior count mismatch: saw {}/{} expected {}/{}",
                            self.ss.num_fassociate,
                            self.ss.num_xstillopen,
                            num_fassociate_entries,
                            num_xstillopen_entries
                        )));
                    }
                    self.ss.direction = ScanDirection::ForwardNewerCheckpointEnd;
                    Ok(())
                }
                _ => Err(self.corrupt("unexpected end_checkpoint during forward scan")),
            },
            LogRecord::Fassociate {
                filenum,
                iname,
                unlink_on_close,
                ..
            } => self.recover_fassociate(*filenum, iname, *unlink_on_close),
            LogRecord::Xstillopen {
                lsn,
                xid,
                parent_xid,
                rollentry_raw_count,
                open_filenums,
                force_fsync_on_commit,
                num_rollback_nodes,
                num_rollentries,
                spilled_rollback_head,
                spilled_rollback_tail,
                current_rollback,
                ..
            } => {
                let _txn = self.recover_xstillopen(
                    *lsn,
                    *xid,
                    *parent_xid,
                    *rollentry_raw_count,
                    open_filenums,
                    *force_fsync_on_commit,
                    *num_rollback_nodes,
                    *num_rollentries,
                    *spilled_rollback_head,
                    *spilled_rollback_tail,
                    *current_rollback,
                    None,
                )?;
                Ok(())
            }
            LogRecord::XstillopenPrepared {
                lsn,
                xid,
                xa_xid,
                rollentry_raw_count,
                open_filenums,
                force_fsync_on_commit,
                num_rollback_nodes,
                num_rollentries,
                spilled_rollback_head,
                spilled_rollback_tail,
                current_rollback,
                ..
            } => {
                let _txn = self.recover_xstillopen(
                    *lsn,
                    *xid,
                    TxnidPair::NONE,
                    *rollentry_raw_count,
                    open_filenums,
                    *force_fsync_on_commit,
                    *num_rollback_nodes,
                    *num_rollentries,
                    *spilled_rollback_head,
                    *spilled_rollback_tail,
                    *current_rollback,
                    Some(*xa_xid),
                )?;
                Ok(())
            }
            LogRecord::Xbegin {
                xid, parent_xid, ..
            } => {
                self.recover_transaction(*xid, *parent_xid)?;
                Ok(())
            }
            LogRecord::Xcommit { lsn, xid } => {
                let txn = self.find_txn(*xid)?;
                commit_txn_with_lsn(
                    &txn,
                    self.logger,
                    self.handler.rollback_target(),
                    true,
                    *lsn,
                    None,
                )?;
                complete_txn(&txn, self.logger)?;
                Ok(())
            }
            LogRecord::Xabort { lsn, xid } => {
                let txn = self.find_txn(*xid)?;
                abort_txn_with_lsn(
                    &txn,
                    self.logger,
                    self.handler.rollback_target(),
                    *lsn,
                    None,
                )?;
                complete_txn(&txn, self.logger)?;
                Ok(())
            }
            LogRecord::Xprepare { xid, xa_xid, .. } => {
                let txn = self.find_txn(*xid)?;
                prepare_txn(&txn, self.logger, xa_xid)
            }
            LogRecord::Fcreate {
                lsn,
                xid,
                filenum,
                iname,
                ..
            } => {
                let txn = self.find_txn(*xid)?;
                self.handler.redo_fcreate(&txn, *filenum, iname, *lsn)?;
                self.fmap.insert(*filenum, iname.clone());
                Ok(())
            }
            LogRecord::Fopen {
                iname, filenum, ..
            } => {
                if self.handler.open_dictionary(iname, *filenum, false, false)? {
                    self.fmap.insert(*filenum, iname.clone());
                }
                Ok(())
            }
            LogRecord::Fclose {
                lsn,
                iname,
                filenum,
            } => {
                if self.fmap.remove(filenum).is_some() {
                    self.handler.redo_fclose(iname, *filenum, *lsn)?;
                }
                Ok(())
            }
            LogRecord::Fdelete { lsn, xid, filenum } => {
                let txn = self.find_txn(*xid)?;
                self.handler.redo_fdelete(&txn, *filenum, *lsn)
            }
            LogRecord::ChangeFdescriptor {
                lsn,
                xid,
                filenum,
                old_descriptor,
                new_descriptor,
                update_cmp_descriptor,
            } => {
                let txn = self.find_txn(*xid)?;
                self.handler.redo_change_fdescriptor(
                    &txn,
                    *filenum,
                    old_descriptor,
                    new_descriptor,
                    *update_cmp_descriptor,
                    *lsn,
                )
            }
            LogRecord::SuppressRollback { filenum, xid, .. } => {
                if self.fmap.contains_key(filenum) {
                    let txn = self.find_txn(*xid)?;
                    self.handler.redo_suppress_rollback(&txn, *filenum)?;
                }
                Ok(())
            }
            LogRecord::EnqInsert {
                lsn,
                filenum,
                xids,
                key,
                value,
            } => {
                let txn = self.txn_for_xids(xids)?;
                self.handler
                    .redo_insert(&txn, *filenum, xids, key, value, false, *lsn)
            }
            LogRecord::EnqInsertNoOverwrite {
                lsn,
                filenum,
                xids,
                key,
                value,
            } => {
                let txn = self.txn_for_xids(xids)?;
                self.handler
                    .redo_insert(&txn, *filenum, xids, key, value, true, *lsn)
            }
            LogRecord::EnqDeleteAny {
                lsn,
                filenum,
                xids,
                key,
            } => {
                let txn = self.txn_for_xids(xids)?;
                self.handler.redo_delete(&txn, *filenum, xids, key, *lsn)
            }
            LogRecord::EnqInsertMultiple {
                lsn,
                dest_filenums,
                xids,
                src_key,
                src_value,
                ..
            } => {
                let txn = self.txn_for_xids(xids)?;
                for filenum in dest_filenums {
                    self.handler
                        .redo_insert(&txn, *filenum, xids, src_key, src_value, false, *lsn)?;
                }
                Ok(())
            }
            LogRecord::EnqDeleteMultiple {
                lsn,
                dest_filenums,
                xids,
                src_key,
                ..
            } => {
                let txn = self.txn_for_xids(xids)?;
                for filenum in dest_filenums {
                    self.handler
                        .redo_delete(&txn, *filenum, xids, src_key, *lsn)?;
                }
                Ok(())
            }
            LogRecord::EnqUpdate {
                lsn,
                filenum,
                xids,
                key,
                extra,
            } => {
                let txn = self.txn_for_xids(xids)?;
                self.handler
                    .redo_update(&txn, *filenum, xids, key, extra, *lsn)
            }
            LogRecord::EnqUpdateBroadcast {
                lsn,
                filenum,
                xids,
                extra,
                is_resetting,
            } => {
                let txn = self.txn_for_xids(xids)?;
                self.handler
                    .redo_update_broadcast(&txn, *filenum, xids, extra, *is_resetting, *lsn)
            }
            LogRecord::Load {
                lsn,
                xid,
                old_iname,
                new_iname,
            } => {
                let txn = self.find_txn(*xid)?;
                self.handler.redo_load(&txn, old_iname, new_iname, *lsn)
            }
            LogRecord::HotIndex {
                lsn,
                xid,
                hot_index_filenums,
            } => {
                let txn = self.find_txn(*xid)?;
                self.handler.redo_hot_index(&txn, hot_index_filenums, *lsn)
            }
            // Comments and shutdown markers carry no replayable effect.
            LogRecord::Comment { .. }
            | LogRecord::Shutdown { .. }
            | LogRecord::ShutdownUpTo19 { .. } => Ok(()),
        }
    }

    fn recover_fassociate(
        &mut self,
        filenum: Filenum,
        iname: &[u8],
        unlink_on_close: bool,
    ) -> Result<()> {
        match self.ss.direction {
            ScanDirection::ForwardBetweenCheckpointBeginEnd => {
                self.ss.num_fassociate += 1;
                if self.fmap.contains_key(&filenum) {
                    return Err(self.corrupt("fassociate for already-open filenum"));
                }
                if iname == ROLLBACK_CACHEFILE_NAME.as_bytes() {
                    // A rollback file newer than this checkpoint must not
                    // be used; pin the acceptable LSN at checkpoint begin.
                    self.logger.open_rollback_cachefile(
                        self.cachetable,
                        Some(filenum),
                        self.ss.checkpoint_begin_lsn,
                    )?;
                } else if self
                    .handler
                    .open_dictionary(iname, filenum, false, unlink_on_close)?
                {
                    self.fmap.insert(filenum, iname.to_vec());
                }
                Ok(())
            }
            ScanDirection::ForwardNewerCheckpointEnd => {
                if let Some(open_iname) = self.fmap.get(&filenum) {
                    if open_iname != iname {
                        return Err(self.corrupt("fassociate filenum bound to different iname"));
                    }
                }
                Ok(())
            }
            _ => Err(self.corrupt("fassociate during backward scan")),
        }
    }

    /// Create a transaction at a replayed id, re-marking it as logged.
    fn recover_transaction(&self, xid: TxnidPair, parent_xid: TxnidPair) -> Result<Arc<Txn>> {
        let manager = self.logger.txn_manager();
        let parent = if parent_xid.is_none() {
            None
        } else {
            Some(self.find_txn(parent_xid)?)
        };
        if manager.id2txn_pair(xid).is_some() {
            return Err(self.corrupt(format!("txn {xid} created twice during replay")));
        }
        let txn = manager.start_txn(parent, SnapshotType::None, false, Some(xid))?;
        // We only know about it because it was logged; restore the bit
        // (log writes are suppressed during replay).
        txn.maybe_log_begin_for_write_operation(self.logger)?;
        Ok(txn)
    }

    #[allow(clippy::too_many_arguments)]
    fn recover_xstillopen(
        &mut self,
        _lsn: Lsn,
        xid: TxnidPair,
        parent_xid: TxnidPair,
        rollentry_raw_count: u64,
        open_filenums: &[Filenum],
        force_fsync_on_commit: bool,
        num_rollback_nodes: u64,
        num_rollentries: u64,
        spilled_rollback_head: ftx_types::Blocknum,
        spilled_rollback_tail: ftx_types::Blocknum,
        current_rollback: ftx_types::Blocknum,
        prepared_xa_xid: Option<XaXid>,
    ) -> Result<Arc<Txn>> {
        match self.ss.direction {
            ScanDirection::ForwardBetweenCheckpointBeginEnd => {
                self.ss.num_xstillopen += 1;
                if self.ss.last_xid.is_none() {
                    return Err(self.corrupt("xstillopen before begin_checkpoint's last_xid"));
                }
                if xid.parent_id64 > self.ss.last_xid {
                    return Err(self.corrupt("xstillopen id above checkpoint last_xid"));
                }
                let txn = self.recover_transaction(xid, parent_xid)?;
                let open_dictionaries = open_filenums
                    .iter()
                    .filter_map(|f| self.handler.dictionary_handle(*f))
                    .collect();
                txn.load_txninfo(TxnInfo {
                    rollentry_raw_count,
                    open_dictionaries,
                    force_fsync_on_commit,
                    num_rollback_nodes,
                    num_rollentries,
                    spilled_rollback_head,
                    spilled_rollback_tail,
                    current_rollback,
                })?;
                if let Some(xa_xid) = prepared_xa_xid {
                    prepare_txn(&txn, self.logger, &xa_xid)?;
                }
                Ok(txn)
            }
            ScanDirection::ForwardNewerCheckpointEnd => {
                let txn = self.find_txn(xid)?;
                if prepared_xa_xid.is_some() && txn.state() != TxnState::Preparing {
                    return Err(self.corrupt("xstillopenprepared for unprepared txn"));
                }
                Ok(txn)
            }
            _ => Err(self.corrupt("xstillopen during backward scan")),
        }
    }
}

// ---------------------------------------------------------------------------
// The scan driver
// ---------------------------------------------------------------------------

/// Run recovery over `log_dir`. The logger must already be open on that
/// directory with log writes suppressed turned on by this function; on
/// success logging resumes past the replayed tail.
pub fn recover(
    logger: &Logger,
    cachetable: &Cachetable,
    handler: &dyn RecoveryHandler,
    log_dir: &Path,
    callback_after_turnaround: Option<&(dyn Fn() + Sync)>,
    callback_after_forward: Option<&(dyn Fn() + Sync)>,
) -> Result<()> {
    let started = Instant::now();
    info!(log_dir = %log_dir.display(), "recovery starting");
    logger.set_write_log_files(false);

    let last_lsn = logger.writer().last_lsn();
    let mut cursor = LogCursor::create(log_dir)?;

    let mut env = RecoverEnv {
        logger,
        cachetable,
        handler,
        ss: ScanState::new(),
        fmap: BTreeMap::new(),
        goforward: false,
    };

    // Backward pass: find the last complete checkpoint.
    let mut record = cursor
        .last()?
        .ok_or_else(|| FtxError::run_recovery("recovery requested on an empty log"))?;
    let mut scanned = 0_u64;
    let mut last_report = Instant::now();
    loop {
        debug_assert!(matches!(
            env.ss.direction,
            ScanDirection::BackwardNewerCheckpointEnd
                | ScanDirection::BackwardBetweenCheckpointBeginEnd
        ));
        env.dispatch_backward(&record)?;
        if env.goforward {
            break;
        }
        scanned += 1;
        if scanned % PROGRESS_CHECK_PERIOD == 0
            && last_report.elapsed().as_secs() >= PROGRESS_REPORT_SECS
        {
            info!(
                at = %record.lsn(),
                from = %last_lsn,
                state = env.ss.direction.as_str(),
                "recovery scanning backward"
            );
            last_report = Instant::now();
        }
        record = cursor.prev()?.ok_or_else(|| {
            FtxError::run_recovery("no complete checkpoint found scanning backward")
        })?;
    }

    if let Some(cb) = callback_after_turnaround {
        cb();
    }

    // Forward pass: replay from the turnaround to the tail.
    info!(
        from = %record.lsn(),
        to = %last_lsn,
        left = last_lsn.get() - record.lsn().get(),
        "recovery scanning forward"
    );
    loop {
        debug_assert!(matches!(
            env.ss.direction,
            ScanDirection::ForwardBetweenCheckpointBeginEnd
                | ScanDirection::ForwardNewerCheckpointEnd
        ));
        env.dispatch_forward(&record)?;
        scanned += 1;
        if scanned % PROGRESS_CHECK_PERIOD == 0
            && last_report.elapsed().as_secs() >= PROGRESS_REPORT_SECS
        {
            info!(
                at = %record.lsn(),
                to = %last_lsn,
                left = last_lsn.get() - record.lsn().get(),
                state = env.ss.direction.as_str(),
                "recovery scanning forward"
            );
            last_report = Instant::now();
        }
        match cursor.next()? {
            Some(next) => record = next,
            None => break,
        }
    }
    if env.ss.direction != ScanDirection::ForwardNewerCheckpointEnd {
        return Err(env.corrupt("log ended inside the checkpoint interior"));
    }

    if let Some(cb) = callback_after_forward {
        cb();
    }

    // Resume logging past the replayed tail.
    logger.restart(last_lsn)?;

    // Abort the unprepared survivors in descending txnid order (children
    // carry later ids than their parents, so they abort first).
    let live = logger.txn_manager().num_live_root_txns();
    if live > 0 {
        info!(live, "recovery has live transactions");
    }
    loop {
        let candidate = logger
            .txn_manager()
            .live_txns_all()
            .into_iter()
            .filter(|t| t.state() == TxnState::Live)
            .max_by_key(|t| t.txnid().own_id());
        let Some(txn) = candidate else { break };
        abort_txn_with_lsn(&txn, logger, handler.rollback_target(), Lsn::ZERO, None)?;
        complete_txn(&txn, logger)?;
    }

    // Whatever survives is prepared; hand it to the layer above.
    let prepared: Vec<Arc<Txn>> = logger
        .txn_manager()
        .live_root_txns()
        .into_iter()
        .filter(|t| t.state() == TxnState::Preparing)
        .collect();
    if !prepared.is_empty() {
        info!(prepared = prepared.len(), "recovery has prepared transactions");
        for txn in &prepared {
            handler.prepared_txn(txn);
        }
    }

    // Close the dictionaries the replay opened.
    let n = env.fmap.len();
    if n > 0 {
        info!(dictionaries = n, "recovery closing dictionaries");
    }
    handler.close_all_dictionaries(last_lsn)?;

    let comment_lsn = logger.log(LogRecord::Comment {
        lsn: Lsn::ZERO,
        timestamp: 0,
        comment: b"recover".to_vec(),
    })?;
    logger.fsync_if_lsn_not_fsynced(comment_lsn)?;

    info!("recovery making a checkpoint");
    handler.recovery_checkpoint()?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "recovery done");
    Ok(())
}
