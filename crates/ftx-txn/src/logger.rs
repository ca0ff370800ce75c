//! The logger: the log writer plus the transaction-side state that rides
//! along with it — the rollback cachefile, the one-slot rollback node
//! cache, and the last-completed-checkpoint LSN the trimmer consults.
//!
//! During recovery replay, log writes are suppressed: handlers drive the
//! same commit/abort paths as live traffic, but nothing is re-logged until
//! `restart` switches the logger back into write mode.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::info;

use ftx_cachetable::{Cachefile, Cachetable};
use ftx_error::{FtxError, Result};
use ftx_log::{LogRecord, LogWriter};
use ftx_types::{Filenum, Lsn};

use crate::manager::TxnManager;
use crate::rollback::{
    DEFAULT_ROLLBACK_SPILL_THRESHOLD, ROLLBACK_CACHEFILE_NAME, RollbackNodeCache,
    RollbackPageCodec,
};

/// Logger construction knobs.
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Soft maximum log segment size in bytes.
    pub lg_max: u64,
    /// Rollback node spill threshold in bytes.
    pub rollback_spill_threshold: u64,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            lg_max: ftx_log::DEFAULT_LG_MAX,
            rollback_spill_threshold: DEFAULT_ROLLBACK_SPILL_THRESHOLD,
        }
    }
}

/// The logger. One per engine instance; owned by it, never global.
pub struct Logger {
    writer: LogWriter,
    txn_manager: Arc<TxnManager>,
    rollback_cachefile: Mutex<Option<Arc<Cachefile>>>,
    node_cache: RollbackNodeCache,
    spill_threshold: u64,
    write_log_files: AtomicBool,
    last_completed_checkpoint_lsn: AtomicU64,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    /// Open the log directory and bind the logger to `txn_manager`.
    pub fn open(
        log_dir: &Path,
        txn_manager: Arc<TxnManager>,
        options: &LoggerOptions,
    ) -> Result<Self> {
        let writer = LogWriter::open(log_dir, options.lg_max)?;
        Ok(Self {
            writer,
            txn_manager,
            rollback_cachefile: Mutex::new(None),
            node_cache: RollbackNodeCache::new(),
            spill_threshold: options.rollback_spill_threshold,
            write_log_files: AtomicBool::new(true),
            last_completed_checkpoint_lsn: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    #[must_use]
    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txn_manager
    }

    #[must_use]
    pub fn rollback_node_cache(&self) -> &RollbackNodeCache {
        &self.node_cache
    }

    #[must_use]
    pub fn rollback_spill_threshold(&self) -> u64 {
        self.spill_threshold
    }

    /// Append a record, honoring write suppression (recovery replay).
    /// Returns `ZERO` when suppressed.
    pub fn log(&self, record: LogRecord) -> Result<Lsn> {
        if !self.write_log_files.load(Ordering::Acquire) {
            return Ok(Lsn::ZERO);
        }
        self.writer.append(record)
    }

    /// Fsync up to `lsn` if the on-disk position is behind. `ZERO` is a
    /// no-op, so read-only transactions never sync.
    pub fn fsync_if_lsn_not_fsynced(&self, lsn: Lsn) -> Result<()> {
        if !self.write_log_files.load(Ordering::Acquire) {
            return Ok(());
        }
        self.writer.fsync_if_lsn_not_fsynced(lsn)
    }

    /// Turn log writing off (recovery replay) or on.
    pub fn set_write_log_files(&self, write: bool) {
        self.write_log_files.store(write, Ordering::Release);
    }

    /// Resume logging after recovery at `last_lsn + 1`.
    pub fn restart(&self, last_lsn: Lsn) -> Result<()> {
        self.writer.restart(last_lsn)?;
        self.set_write_log_files(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Last-completed-checkpoint LSN
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn last_completed_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.last_completed_checkpoint_lsn.load(Ordering::Acquire))
    }

    /// Record a completed checkpoint. Non-decreasing by construction.
    pub fn set_last_completed_checkpoint_lsn(&self, lsn: Lsn) {
        self.last_completed_checkpoint_lsn
            .fetch_max(lsn.get(), Ordering::AcqRel);
    }

    /// Unlink log segments wholly covered by the last completed checkpoint.
    pub fn maybe_trim_log(&self, last_completed_checkpoint_lsn: Lsn) -> Result<()> {
        self.writer.maybe_trim(last_completed_checkpoint_lsn)
    }

    // -----------------------------------------------------------------------
    // Rollback cachefile
    // -----------------------------------------------------------------------

    /// Open (or create) the rollback cachefile in `cachetable` and attach
    /// it. `filenum` is pinned during recovery replay; `max_acceptable_lsn`
    /// refuses a rollback file newer than the checkpoint being recovered.
    pub fn open_rollback_cachefile(
        &self,
        cachetable: &Cachetable,
        filenum: Option<Filenum>,
        max_acceptable_lsn: Lsn,
    ) -> Result<Arc<Cachefile>> {
        let mut slot = self.rollback_cachefile.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let cf = cachetable.open_cachefile(
            ROLLBACK_CACHEFILE_NAME,
            filenum,
            Arc::new(RollbackPageCodec),
            max_acceptable_lsn,
        )?;
        info!(filenum = cf.filenum().get(), "rollback cachefile opened");
        *slot = Some(Arc::clone(&cf));
        Ok(cf)
    }

    /// The attached rollback cachefile; transactions cannot run without it.
    pub fn rollback_cachefile(&self) -> Result<Arc<Cachefile>> {
        self.rollback_cachefile
            .lock()
            .clone()
            .ok_or_else(|| FtxError::internal("rollback cachefile not open"))
    }

    /// Detach and close the rollback cachefile at logger teardown.
    pub fn close_rollback_cachefile(&self, cachetable: &Cachetable) -> Result<()> {
        let cf = self.rollback_cachefile.lock().take();
        if let Some(cf) = cf {
            cachetable.close_cachefile(cf.filenum())?;
        }
        Ok(())
    }

    /// Clean shutdown record plus final fsync.
    pub fn log_shutdown(&self, timestamp: u64) -> Result<()> {
        let lsn = self.log(LogRecord::Shutdown {
            lsn: Lsn::ZERO,
            timestamp,
        })?;
        self.fsync_if_lsn_not_fsynced(lsn)
    }
}
