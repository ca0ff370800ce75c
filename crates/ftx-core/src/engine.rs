//! The engine: one value owning the logger, the cachetable, the
//! transaction manager, and the checkpoint coordinator. Nothing here is a
//! process-wide static; tests construct fresh engines side by side.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use ftx_cachetable::Cachetable;
use ftx_checkpoint::{
    CheckpointCaller, CheckpointScheduler, CheckpointStatusSnapshot, Checkpointer,
};
use ftx_error::{FtxError, Result};
use ftx_log::LogRecord;
use ftx_recover::RecoveryHandler;
use ftx_txn::rollback::{RollEntry, save_rollback};
use ftx_txn::{
    Logger, LoggerOptions, OpenDictionary, RollbackTarget, Txn, TxnManager, TxnStatusSnapshot,
    abort_txn_with_lsn, commit_txn_with_lsn, complete_txn, maybe_fsync_log, prepare_txn,
};
use ftx_types::{Filenum, Lsn, SnapshotType, XaXid, Xids};

use crate::dictionary::{Dictionary, DictionaryPageCodec};

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Period of scheduled checkpoints; zero disables them.
    pub checkpoint_period: Duration,
    /// Soft maximum log segment size in bytes.
    pub lg_max: u64,
    /// Rollback node spill threshold in bytes.
    pub rollback_spill_threshold: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            checkpoint_period: Duration::from_secs(60),
            lg_max: ftx_log::DEFAULT_LG_MAX,
            rollback_spill_threshold: ftx_txn::rollback::DEFAULT_ROLLBACK_SPILL_THRESHOLD,
        }
    }
}

/// Combined status export.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub txn: TxnStatusSnapshot,
    pub checkpoint: CheckpointStatusSnapshot,
    pub checkpoint_period_secs: u64,
    pub last_lsn: u64,
    pub last_completed_checkpoint_lsn: u64,
    pub oldest_referenced_xid: u64,
    pub num_live_root_txns: u64,
}

impl EngineStatus {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FtxError::internal(e.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn iname_str(iname: &[u8]) -> Result<&str> {
    std::str::from_utf8(iname)
        .map_err(|_| FtxError::Invalid("dictionary iname is not utf-8".to_owned()))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A durable, crash-safe, MVCC-capable transactional engine instance.
pub struct Engine {
    env_dir: PathBuf,
    checkpoint_period: Duration,
    cachetable: Arc<Cachetable>,
    manager: Arc<TxnManager>,
    logger: Arc<Logger>,
    checkpointer: Arc<Checkpointer>,
    scheduler: Mutex<Option<CheckpointScheduler>>,
    dictionaries: Mutex<BTreeMap<Filenum, Arc<Dictionary>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine rooted at `env_dir`, running recovery when the log
    /// does not end in a clean shutdown, and taking a startup checkpoint.
    pub fn open(env_dir: &Path, options: &EngineOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(env_dir)?;
        let log_dir = env_dir.join("logs");

        let cachetable = Arc::new(Cachetable::new(env_dir.to_path_buf()));
        let manager = Arc::new(TxnManager::new());
        let logger = Arc::new(Logger::open(
            &log_dir,
            Arc::clone(&manager),
            &LoggerOptions {
                lg_max: options.lg_max,
                rollback_spill_threshold: options.rollback_spill_threshold,
            },
        )?);
        let checkpointer = Arc::new(Checkpointer::new(
            Arc::clone(&cachetable),
            Arc::clone(&logger),
        ));

        let engine = Arc::new(Self {
            env_dir: env_dir.to_path_buf(),
            checkpoint_period: options.checkpoint_period,
            cachetable,
            manager,
            logger,
            checkpointer,
            scheduler: Mutex::new(None),
            dictionaries: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        });

        {
            let lock = ftx_recover::recover_lock(&log_dir)?;
            if ftx_recover::needs_recovery(&log_dir, true)? {
                info!(env = %env_dir.display(), "unclean shutdown, recovering");
                ftx_recover::recover(
                    &engine.logger,
                    &engine.cachetable,
                    engine.as_ref(),
                    &log_dir,
                    None,
                    None,
                )?;
            }
            // A fresh directory (or one whose log was fully trimmed) has
            // no fassociate to open the rollback file from.
            engine
                .logger
                .open_rollback_cachefile(&engine.cachetable, None, Lsn::MAX)?;
            drop(lock);
        }

        engine.checkpoint(CheckpointCaller::Startup)?;

        if !options.checkpoint_period.is_zero() {
            *engine.scheduler.lock() = Some(CheckpointScheduler::start(
                Arc::clone(&engine.checkpointer),
                options.checkpoint_period,
            ));
        }
        info!(env = %env_dir.display(), "engine open");
        Ok(engine)
    }

    /// Clean shutdown: final checkpoint, `shutdown` record, close files.
    /// The caller must have no live transactions.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        if self.manager.txns_exist() {
            return Err(FtxError::Busy);
        }
        self.checkpoint(CheckpointCaller::Shutdown)?;
        self.logger.log_shutdown(unix_now())?;

        let dictionaries: Vec<Arc<Dictionary>> =
            self.dictionaries.lock().values().cloned().collect();
        for dict in dictionaries {
            dict.cachefile().flush_dirty()?;
            self.cachetable.close_cachefile(dict.filenum())?;
        }
        self.dictionaries.lock().clear();
        self.logger.close_rollback_cachefile(&self.cachetable)?;
        info!(env = %self.env_dir.display(), "engine closed");
        Ok(())
    }

    #[must_use]
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    #[must_use]
    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.manager
    }

    #[must_use]
    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    /// Force an fsync of everything logged so far.
    pub fn fsync_log(&self) -> Result<()> {
        self.logger.writer().fsync()
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            txn: self.manager.status().snapshot(),
            checkpoint: self.checkpointer.status().snapshot(),
            checkpoint_period_secs: self.checkpoint_period.as_secs(),
            last_lsn: self.logger.writer().last_lsn().get(),
            last_completed_checkpoint_lsn: self.logger.last_completed_checkpoint_lsn().get(),
            oldest_referenced_xid: self.manager.oldest_referenced_xid_estimate().get(),
            num_live_root_txns: self.manager.num_live_root_txns() as u64,
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Begin a transaction. Ids and snapshot state are assigned atomically
    /// by the manager; no log record is written until the first write.
    pub fn txn_begin(
        &self,
        parent: Option<&Arc<Txn>>,
        snapshot_type: SnapshotType,
    ) -> Result<Arc<Txn>> {
        self.manager
            .start_txn(parent.cloned(), snapshot_type, false, None)
    }

    /// Prepare a root transaction under an XA identifier and make the log
    /// durable.
    pub fn txn_prepare(&self, txn: &Arc<Txn>, xa_xid: &XaXid) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        prepare_txn(txn, &self.logger, xa_xid)?;
        drop(_mo);
        let (do_fsync, lsn) = txn.fsync_info();
        maybe_fsync_log(&self.logger, lsn, do_fsync)
    }

    /// Commit. With `nosync` the log fsync is skipped (durability deferred
    /// to the next sync); read-only transactions never sync.
    pub fn txn_commit(&self, txn: &Arc<Txn>, nosync: bool) -> Result<()> {
        if txn.requires_checkpoint() {
            self.checkpoint(CheckpointCaller::TxnCommit)?;
        }
        {
            let _mo = self.checkpointer.multi_operation_client_lock();
            commit_txn_with_lsn(txn, &self.logger, self, nosync, Lsn::ZERO, None)?;
            complete_txn(txn, &self.logger)?;
        }
        let (do_fsync, lsn) = txn.fsync_info();
        maybe_fsync_log(&self.logger, lsn, do_fsync)
    }

    /// Abort: walk the undo chain and discard every effect.
    pub fn txn_abort(&self, txn: &Arc<Txn>) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        abort_txn_with_lsn(txn, &self.logger, self, Lsn::ZERO, None)?;
        complete_txn(txn, &self.logger)
    }

    /// XA recovery: prepared transactions in txnid order. `first` restarts
    /// the scan; a short result ends it.
    #[must_use]
    pub fn recover_root_txns(&self, first: bool, max: usize) -> Vec<(XaXid, Arc<Txn>)> {
        self.manager
            .recover_root_txns(first, max)
            .into_iter()
            .map(|txn| (txn.prepared_xa_xid(), txn))
            .collect()
    }

    /// Take a checkpoint now.
    pub fn checkpoint(&self, caller: CheckpointCaller) -> Result<()> {
        self.checkpointer.checkpoint(caller, None, None)
    }

    // -----------------------------------------------------------------------
    // Dictionaries
    // -----------------------------------------------------------------------

    fn dictionary_by_filenum(&self, filenum: Filenum) -> Option<Arc<Dictionary>> {
        self.dictionaries.lock().get(&filenum).cloned()
    }

    fn dictionary_by_iname(&self, iname: &str) -> Option<Arc<Dictionary>> {
        self.dictionaries
            .lock()
            .values()
            .find(|d| d.iname() == iname)
            .cloned()
    }

    fn attach_dictionary(
        &self,
        iname: &str,
        filenum: Option<Filenum>,
        create: bool,
    ) -> Result<Arc<Dictionary>> {
        if create {
            let path = self.env_dir.join(iname);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let cachefile = self.cachetable.open_cachefile(
            iname,
            filenum,
            Arc::new(DictionaryPageCodec),
            Lsn::MAX,
        )?;
        let dict = Dictionary::attach(cachefile)?;
        self.dictionaries
            .lock()
            .insert(dict.filenum(), Arc::clone(&dict));
        Ok(dict)
    }

    /// Create a dictionary inside `txn`; aborting the transaction unlinks
    /// it again.
    pub fn create_dictionary(&self, txn: &Arc<Txn>, name: &str) -> Result<Arc<Dictionary>> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        if self.dictionary_by_iname(name).is_some() {
            return Err(FtxError::Busy);
        }
        txn.maybe_log_begin_for_write_operation(&self.logger)?;
        let dict = self.attach_dictionary(name, None, true)?;
        dict.set_created_by(txn.root_txnid());
        save_rollback(
            txn,
            &self.logger,
            RollEntry::FileCreate {
                filenum: dict.filenum(),
                iname: name.as_bytes().to_vec(),
            },
        )?;
        self.logger.log(LogRecord::Fcreate {
            lsn: Lsn::ZERO,
            xid: txn.txnid(),
            filenum: dict.filenum(),
            iname: name.as_bytes().to_vec(),
            treeflags: 0,
        })?;
        self.note_dictionary(txn, &dict);
        debug!(name, filenum = dict.filenum().get(), "dictionary created");
        Ok(dict)
    }

    /// Open an existing dictionary (or start an empty one if the file was
    /// never checkpointed).
    pub fn open_dictionary(&self, name: &str) -> Result<Arc<Dictionary>> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        if let Some(dict) = self.dictionary_by_iname(name) {
            return Ok(dict);
        }
        let dict = self.attach_dictionary(name, None, false)?;
        self.logger.log(LogRecord::Fopen {
            lsn: Lsn::ZERO,
            iname: name.as_bytes().to_vec(),
            filenum: dict.filenum(),
            treeflags: 0,
        })?;
        Ok(dict)
    }

    /// Delete a dictionary inside `txn`. The unlink happens at commit;
    /// until then the file survives for abort. Excluded from running
    /// during a checkpoint.
    pub fn delete_dictionary(&self, txn: &Arc<Txn>, name: &str) -> Result<()> {
        let _cs = self.checkpointer.checkpoint_safe_client_lock();
        let dict = self
            .dictionary_by_iname(name)
            .ok_or(FtxError::NotFound)?;
        txn.maybe_log_begin_for_write_operation(&self.logger)?;
        self.note_dictionary(txn, &dict);
        save_rollback(
            txn,
            &self.logger,
            RollEntry::FileDelete {
                filenum: dict.filenum(),
                iname: name.as_bytes().to_vec(),
            },
        )?;
        self.logger.log(LogRecord::Fdelete {
            lsn: Lsn::ZERO,
            xid: txn.txnid(),
            filenum: dict.filenum(),
        })?;
        Ok(())
    }

    fn note_dictionary(&self, txn: &Arc<Txn>, dict: &Arc<Dictionary>) {
        let handle: Arc<dyn OpenDictionary> = Arc::clone(dict) as Arc<dyn OpenDictionary>;
        txn.maybe_note_dictionary(&handle);
    }

    /// Writes by `txn` to `dict` skip undo logging from here on
    /// (bulk-load path: the dictionary was created by this transaction).
    pub fn suppress_rollback(&self, txn: &Arc<Txn>, dict: &Arc<Dictionary>) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        txn.maybe_log_begin_for_write_operation(&self.logger)?;
        dict.set_suppress_rollback(txn.root_txnid());
        self.note_dictionary(txn, dict);
        self.logger.log(LogRecord::SuppressRollback {
            lsn: Lsn::ZERO,
            filenum: dict.filenum(),
            xid: txn.txnid(),
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    fn write_op(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        undo_entry: RollEntry,
        record: LogRecord,
    ) -> Result<Lsn> {
        txn.maybe_log_begin_for_write_operation(&self.logger)?;
        self.note_dictionary(txn, dict);
        if !dict.rollback_suppressed_for(txn.root_txnid()) {
            save_rollback(txn, &self.logger, undo_entry)?;
        }
        self.logger.log(record)
    }

    /// Insert (overwrite allowed).
    pub fn insert(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::Insert {
                filenum: dict.filenum(),
                key: key.to_vec(),
            },
            LogRecord::EnqInsert {
                lsn: Lsn::ZERO,
                filenum: dict.filenum(),
                xids: txn.xids().clone(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )?;
        dict.apply_insert(txn.xids(), key, value, lsn)
    }

    /// Insert, failing with `KeyExist` if a visible version exists.
    pub fn insert_no_overwrite(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        if dict.get(key, self.visibility_for(txn))?.is_some() {
            return Err(FtxError::KeyExist);
        }
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::Insert {
                filenum: dict.filenum(),
                key: key.to_vec(),
            },
            LogRecord::EnqInsertNoOverwrite {
                lsn: Lsn::ZERO,
                filenum: dict.filenum(),
                xids: txn.xids().clone(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )?;
        dict.apply_insert(txn.xids(), key, value, lsn)
    }

    /// Point delete (tombstone).
    pub fn delete(&self, txn: &Arc<Txn>, dict: &Arc<Dictionary>, key: &[u8]) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::Delete {
                filenum: dict.filenum(),
                key: key.to_vec(),
            },
            LogRecord::EnqDeleteAny {
                lsn: Lsn::ZERO,
                filenum: dict.filenum(),
                xids: txn.xids().clone(),
                key: key.to_vec(),
            },
        )?;
        dict.apply_delete(txn.xids(), key, lsn)
    }

    /// Update: replace the value of `key` with `extra`.
    pub fn update(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        key: &[u8],
        extra: &[u8],
    ) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::Update {
                filenum: dict.filenum(),
                key: key.to_vec(),
            },
            LogRecord::EnqUpdate {
                lsn: Lsn::ZERO,
                filenum: dict.filenum(),
                xids: txn.xids().clone(),
                key: key.to_vec(),
                extra: extra.to_vec(),
            },
        )?;
        dict.apply_insert(txn.xids(), key, extra, lsn)
    }

    /// Broadcast update across the dictionary; `is_resetting` deletes.
    pub fn update_broadcast(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        extra: &[u8],
        is_resetting: bool,
    ) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::UpdateBroadcast {
                filenum: dict.filenum(),
            },
            LogRecord::EnqUpdateBroadcast {
                lsn: Lsn::ZERO,
                filenum: dict.filenum(),
                xids: txn.xids().clone(),
                extra: extra.to_vec(),
                is_resetting,
            },
        )?;
        dict.apply_update_broadcast(txn.xids(), extra, is_resetting, lsn)
    }

    /// Change the dictionary's descriptor inside `txn`.
    pub fn change_descriptor(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        new_descriptor: &[u8],
    ) -> Result<()> {
        let _mo = self.checkpointer.multi_operation_client_lock();
        let old = dict.descriptor()?;
        let lsn = self.write_op(
            txn,
            dict,
            RollEntry::ChangeDescriptor {
                filenum: dict.filenum(),
                old_descriptor: old.clone(),
            },
            LogRecord::ChangeFdescriptor {
                lsn: Lsn::ZERO,
                xid: txn.txnid(),
                filenum: dict.filenum(),
                old_descriptor: old,
                new_descriptor: new_descriptor.to_vec(),
                update_cmp_descriptor: true,
            },
        )?;
        dict.set_descriptor(new_descriptor, lsn)
    }

    /// Read `key` under `txn`'s visibility rules.
    pub fn get(
        &self,
        txn: &Arc<Txn>,
        dict: &Arc<Dictionary>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        dict.get(key, self.visibility_for(txn))
    }

    /// Visible keys under `txn` (test/verification support).
    pub fn keys(&self, txn: &Arc<Txn>, dict: &Arc<Dictionary>) -> Result<Vec<Vec<u8>>> {
        dict.keys(self.visibility_for(txn))
    }

    /// MVCC visibility: a version is visible when it was written by the
    /// reader's own family, or by a root that committed before the
    /// reader's snapshot (for snapshot transactions) respectively before
    /// now (read-committed).
    fn visibility_for(&self, txn: &Arc<Txn>) -> impl Fn(&Xids) -> bool + use<> {
        let own_root = txn.root_txnid();
        let snapshot_txnid = txn.snapshot_txnid();
        let live_list = txn.live_root_txn_list().cloned();
        let manager = Arc::clone(&self.manager);
        move |xids: &Xids| {
            let writer_root = xids.outermost();
            if writer_root == own_root {
                return true;
            }
            match &live_list {
                Some(list) => {
                    writer_root < snapshot_txnid && list.binary_search(&writer_root).is_err()
                }
                None => !manager.is_txnid_live(writer_root),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback target: how aborts and deferred file operations reach the
// dictionaries
// ---------------------------------------------------------------------------

impl RollbackTarget for Engine {
    fn undo_insert(&self, filenum: Filenum, key: &[u8], xids: &Xids, _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionary_by_filenum(filenum) {
            dict.undo_versions(xids, key)?;
        }
        Ok(())
    }

    fn undo_delete(&self, filenum: Filenum, key: &[u8], xids: &Xids, _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionary_by_filenum(filenum) {
            dict.undo_versions(xids, key)?;
        }
        Ok(())
    }

    fn undo_update(&self, filenum: Filenum, key: &[u8], xids: &Xids, _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionary_by_filenum(filenum) {
            dict.undo_versions(xids, key)?;
        }
        Ok(())
    }

    fn undo_update_broadcast(&self, filenum: Filenum, xids: &Xids, _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionary_by_filenum(filenum) {
            dict.undo_versions_broadcast(xids)?;
        }
        Ok(())
    }

    fn commit_file_delete(&self, filenum: Filenum, _iname: &[u8], _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionaries.lock().remove(&filenum) {
            dict.cachefile().set_unlink_on_close(true);
            self.cachetable.close_cachefile(filenum)?;
        }
        Ok(())
    }

    fn abort_file_create(&self, filenum: Filenum, _iname: &[u8], _oplsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionaries.lock().remove(&filenum) {
            dict.cachefile().set_unlink_on_close(true);
            self.cachetable.close_cachefile(filenum)?;
        }
        Ok(())
    }

    fn abort_file_rename(
        &self,
        _filenum: Filenum,
        old_iname: &[u8],
        new_iname: &[u8],
        _oplsn: Lsn,
    ) -> Result<()> {
        let old = self.env_dir.join(iname_str(old_iname)?);
        let new = self.env_dir.join(iname_str(new_iname)?);
        match std::fs::rename(&new, &old) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_load(&self, old_iname: &[u8], _oplsn: Lsn) -> Result<()> {
        let path = self.env_dir.join(iname_str(old_iname)?);
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    fn abort_load(&self, new_iname: &[u8], _oplsn: Lsn) -> Result<()> {
        let path = self.env_dir.join(iname_str(new_iname)?);
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    fn abort_change_descriptor(
        &self,
        filenum: Filenum,
        old_descriptor: &[u8],
        _oplsn: Lsn,
    ) -> Result<()> {
        if let Some(dict) = self.dictionary_by_filenum(filenum) {
            dict.restore_descriptor(old_descriptor)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recovery handler: how replay reaches the dictionaries
// ---------------------------------------------------------------------------

impl RecoveryHandler for Engine {
    fn open_dictionary(
        &self,
        iname: &[u8],
        filenum: Filenum,
        create: bool,
        unlink_on_close: bool,
    ) -> Result<bool> {
        if self.dictionary_by_filenum(filenum).is_some() {
            return Ok(true);
        }
        let name = iname_str(iname)?;
        let dict = self.attach_dictionary(name, Some(filenum), create)?;
        dict.cachefile().set_unlink_on_close(unlink_on_close);
        Ok(true)
    }

    fn dictionary_handle(&self, filenum: Filenum) -> Option<Arc<dyn OpenDictionary>> {
        self.dictionary_by_filenum(filenum)
            .map(|d| d as Arc<dyn OpenDictionary>)
    }

    fn close_all_dictionaries(&self, _oplsn: Lsn) -> Result<()> {
        // Dictionaries referenced by surviving prepared transactions stay
        // open: their undo entries resolve filenums through the engine's
        // map, and a later abort must still find them.
        let mut keep: std::collections::BTreeSet<Filenum> = std::collections::BTreeSet::new();
        for txn in self.manager.live_root_txns() {
            for dict in &txn.inner().open_dictionaries {
                keep.insert(dict.filenum());
            }
        }
        let dictionaries: Vec<Arc<Dictionary>> =
            self.dictionaries.lock().values().cloned().collect();
        for dict in dictionaries {
            dict.cachefile().flush_dirty()?;
            if keep.contains(&dict.filenum()) {
                continue;
            }
            self.dictionaries.lock().remove(&dict.filenum());
            self.cachetable.close_cachefile(dict.filenum())?;
        }
        Ok(())
    }

    fn redo_insert(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        value: &[u8],
        _no_overwrite: bool,
        lsn: Lsn,
    ) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        if !dict.rollback_suppressed_for(txn.root_txnid()) {
            save_rollback(
                txn,
                &self.logger,
                RollEntry::Insert {
                    filenum,
                    key: key.to_vec(),
                },
            )?;
        }
        dict.apply_insert(xids, key, value, lsn)
    }

    fn redo_delete(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        lsn: Lsn,
    ) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        if !dict.rollback_suppressed_for(txn.root_txnid()) {
            save_rollback(
                txn,
                &self.logger,
                RollEntry::Delete {
                    filenum,
                    key: key.to_vec(),
                },
            )?;
        }
        dict.apply_delete(xids, key, lsn)
    }

    fn redo_update(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        key: &[u8],
        extra: &[u8],
        lsn: Lsn,
    ) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        if !dict.rollback_suppressed_for(txn.root_txnid()) {
            save_rollback(
                txn,
                &self.logger,
                RollEntry::Update {
                    filenum,
                    key: key.to_vec(),
                },
            )?;
        }
        dict.apply_insert(xids, key, extra, lsn)
    }

    fn redo_update_broadcast(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        xids: &Xids,
        extra: &[u8],
        is_resetting: bool,
        lsn: Lsn,
    ) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        if !dict.rollback_suppressed_for(txn.root_txnid()) {
            save_rollback(txn, &self.logger, RollEntry::UpdateBroadcast { filenum })?;
        }
        dict.apply_update_broadcast(xids, extra, is_resetting, lsn)
    }

    fn redo_fcreate(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        iname: &[u8],
        _lsn: Lsn,
    ) -> Result<()> {
        // Re-creating is correct even if a file exists: anything on disk
        // under this name is newer than the state being replayed.
        if self.dictionary_by_filenum(filenum).is_some() {
            self.dictionaries.lock().remove(&filenum);
            self.cachetable.close_cachefile(filenum)?;
        }
        let name = iname_str(iname)?;
        let dict = self.attach_dictionary(name, Some(filenum), true)?;
        dict.set_created_by(txn.root_txnid());
        save_rollback(
            txn,
            &self.logger,
            RollEntry::FileCreate {
                filenum,
                iname: iname.to_vec(),
            },
        )?;
        self.note_dictionary(txn, &dict);
        Ok(())
    }

    fn redo_fdelete(&self, txn: &Arc<Txn>, filenum: Filenum, _lsn: Lsn) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        save_rollback(
            txn,
            &self.logger,
            RollEntry::FileDelete {
                filenum,
                iname: dict.iname().as_bytes().to_vec(),
            },
        )
    }

    fn redo_fclose(&self, _iname: &[u8], filenum: Filenum, _lsn: Lsn) -> Result<()> {
        if let Some(dict) = self.dictionaries.lock().remove(&filenum) {
            dict.cachefile().flush_dirty()?;
            self.cachetable.close_cachefile(filenum)?;
        }
        Ok(())
    }

    fn redo_change_fdescriptor(
        &self,
        txn: &Arc<Txn>,
        filenum: Filenum,
        old_descriptor: &[u8],
        new_descriptor: &[u8],
        _update_cmp_descriptor: bool,
        lsn: Lsn,
    ) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        self.note_dictionary(txn, &dict);
        save_rollback(
            txn,
            &self.logger,
            RollEntry::ChangeDescriptor {
                filenum,
                old_descriptor: old_descriptor.to_vec(),
            },
        )?;
        dict.set_descriptor(new_descriptor, lsn)
    }

    fn redo_suppress_rollback(&self, txn: &Arc<Txn>, filenum: Filenum) -> Result<()> {
        let Some(dict) = self.dictionary_by_filenum(filenum) else {
            return Ok(());
        };
        dict.set_suppress_rollback(txn.root_txnid());
        self.note_dictionary(txn, &dict);
        Ok(())
    }

    fn redo_load(
        &self,
        txn: &Arc<Txn>,
        old_iname: &[u8],
        new_iname: &[u8],
        _lsn: Lsn,
    ) -> Result<()> {
        save_rollback(
            txn,
            &self.logger,
            RollEntry::Load {
                old_iname: old_iname.to_vec(),
                new_iname: new_iname.to_vec(),
            },
        )
    }

    fn redo_hot_index(&self, txn: &Arc<Txn>, filenums: &[Filenum], _lsn: Lsn) -> Result<()> {
        save_rollback(
            txn,
            &self.logger,
            RollEntry::HotIndex {
                filenums: filenums.to_vec(),
            },
        )
    }

    fn rollback_target(&self) -> &dyn RollbackTarget {
        self
    }

    fn prepared_txn(&self, txn: &Arc<Txn>) {
        info!(txnid = %txn.txnid(), "recovered prepared transaction");
    }

    fn recovery_checkpoint(&self) -> Result<()> {
        self.checkpointer
            .checkpoint(CheckpointCaller::Recovery, None, None)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("env_dir", &self.env_dir)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
