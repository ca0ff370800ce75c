//! The checkpoint driver and its lock hierarchy.
//!
//! Three reader-writer locks exist per engine, always acquired in this
//! order:
//!
//! 1. `checkpoint_safe_lock` — writer for the whole checkpoint; readers
//!    are operations that must not overlap a checkpoint at all
//!    (dictionary delete/rename, backup quiesce).
//! 2. `low_priority_multi_operation_lock` — writer taken alongside the
//!    multi-operation writer; low-priority readers see the checkpoint's
//!    intent before new high-priority readers, so a stream of them cannot
//!    starve the checkpoint.
//! 3. `multi_operation_lock` — writer only for the brief pending-bit
//!    marking window; reader for every mutation that must be atomic
//!    against checkpoint begin.
//!
//! `parking_lot`'s rwlocks are fair towards writers (no new-reader
//! starvation of a waiting writer), which is the behavior the lock order
//! relies on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use tracing::{info, warn};

use ftx_cachetable::Cachetable;
use ftx_error::Result;
use ftx_log::LogRecord;
use ftx_txn::{Logger, TxnManager};
use ftx_types::{Lsn, TxnState};

/// Begin phases slower than this many microseconds count as "long".
pub const DEFAULT_LONG_BEGIN_THRESHOLD_US: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Caller identification (instrumentation only)
// ---------------------------------------------------------------------------

/// Who asked for this checkpoint. Only instrumentation branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckpointCaller {
    Scheduled = 0,
    Client = 1,
    TxnCommit = 2,
    Indexer = 3,
    Startup = 4,
    Upgrade = 5,
    Recovery = 6,
    Shutdown = 7,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Checkpoint status counters. Relaxed atomics; display-only.
#[derive(Default)]
pub struct CheckpointStatus {
    footprint: AtomicU64,
    time_last_begin: AtomicU64,
    time_last_begin_complete: AtomicU64,
    time_last_end: AtomicU64,
    last_lsn: AtomicU64,
    checkpoint_count: AtomicU64,
    checkpoint_count_fail: AtomicU64,
    waiters_now: AtomicU64,
    waiters_max: AtomicU64,
    client_wait_on_mo: AtomicU64,
    client_wait_on_cs: AtomicU64,
    begin_time_us: AtomicU64,
    long_begin_count: AtomicU64,
    long_begin_time_us: AtomicU64,
}

/// Point-in-time copy of [`CheckpointStatus`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointStatusSnapshot {
    pub footprint: u64,
    pub time_last_begin: u64,
    pub time_last_begin_complete: u64,
    pub time_last_end: u64,
    pub last_lsn: u64,
    pub checkpoint_count: u64,
    pub checkpoint_count_fail: u64,
    pub waiters_now: u64,
    pub waiters_max: u64,
    pub client_wait_on_mo: u64,
    pub client_wait_on_cs: u64,
    pub begin_time_us: u64,
    pub long_begin_count: u64,
    pub long_begin_time_us: u64,
}

impl CheckpointStatus {
    #[must_use]
    pub fn snapshot(&self) -> CheckpointStatusSnapshot {
        CheckpointStatusSnapshot {
            footprint: self.footprint.load(Ordering::Relaxed),
            time_last_begin: self.time_last_begin.load(Ordering::Relaxed),
            time_last_begin_complete: self.time_last_begin_complete.load(Ordering::Relaxed),
            time_last_end: self.time_last_end.load(Ordering::Relaxed),
            last_lsn: self.last_lsn.load(Ordering::Relaxed),
            checkpoint_count: self.checkpoint_count.load(Ordering::Relaxed),
            checkpoint_count_fail: self.checkpoint_count_fail.load(Ordering::Relaxed),
            waiters_now: self.waiters_now.load(Ordering::Relaxed),
            waiters_max: self.waiters_max.load(Ordering::Relaxed),
            client_wait_on_mo: self.client_wait_on_mo.load(Ordering::Relaxed),
            client_wait_on_cs: self.client_wait_on_cs.load(Ordering::Relaxed),
            begin_time_us: self.begin_time_us.load(Ordering::Relaxed),
            long_begin_count: self.long_begin_count.load(Ordering::Relaxed),
            long_begin_time_us: self.long_begin_time_us.load(Ordering::Relaxed),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

/// RAII guard for client (reader) participation in the multi-operation
/// protocol.
pub struct MultiOperationGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// RAII guard for operations that exclude checkpoints entirely. Holds the
/// checkpoint-safe reader plus the multi-operation reader, mirroring the
/// driver's acquisition order.
pub struct CheckpointSafeGuard<'a> {
    _cs: RwLockReadGuard<'a, ()>,
    _mo: RwLockReadGuard<'a, ()>,
}

/// The checkpoint coordinator: owns the lock hierarchy and drives the
/// begin/end protocol against the cachetable and the logger.
pub struct Checkpointer {
    checkpoint_safe_lock: RwLock<()>,
    low_priority_multi_operation_lock: RwLock<()>,
    multi_operation_lock: RwLock<()>,
    /// Diagnostics: whether the checkpoint holds the respective writer.
    locked_mo: AtomicBool,
    locked_cs: AtomicBool,
    long_begin_threshold_us: AtomicU64,
    status: CheckpointStatus,
    cachetable: Arc<Cachetable>,
    logger: Arc<Logger>,
}

impl Checkpointer {
    #[must_use]
    pub fn new(cachetable: Arc<Cachetable>, logger: Arc<Logger>) -> Self {
        Self {
            checkpoint_safe_lock: RwLock::new(()),
            low_priority_multi_operation_lock: RwLock::new(()),
            multi_operation_lock: RwLock::new(()),
            locked_mo: AtomicBool::new(false),
            locked_cs: AtomicBool::new(false),
            long_begin_threshold_us: AtomicU64::new(DEFAULT_LONG_BEGIN_THRESHOLD_US),
            status: CheckpointStatus::default(),
            cachetable,
            logger,
        }
    }

    #[must_use]
    pub fn status(&self) -> &CheckpointStatus {
        &self.status
    }

    /// Begin phases slower than this count toward the long-begin stats.
    pub fn set_long_begin_threshold_us(&self, us: u64) {
        self.long_begin_threshold_us.store(us, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Client lock surface
    // -----------------------------------------------------------------------

    /// Reader side of the multi-operation lock: every mutator that must be
    /// atomic against checkpoint begin holds this.
    pub fn multi_operation_client_lock(&self) -> MultiOperationGuard<'_> {
        if self.locked_mo.load(Ordering::Relaxed) {
            self.status.client_wait_on_mo.fetch_add(1, Ordering::Relaxed);
        }
        MultiOperationGuard {
            _guard: self.multi_operation_lock.read(),
        }
    }

    /// Reader side of the low-priority multi-operation lock: work that
    /// does not need write-vs-checkpoint atomicity but should yield to a
    /// pending checkpoint.
    pub fn low_priority_multi_operation_client_lock(&self) -> MultiOperationGuard<'_> {
        MultiOperationGuard {
            _guard: self.low_priority_multi_operation_lock.read(),
        }
    }

    /// Reader side of the checkpoint-safe lock (plus the multi-operation
    /// reader): dictionary delete/rename and backup quiesce hold this.
    pub fn checkpoint_safe_client_lock(&self) -> CheckpointSafeGuard<'_> {
        if self.locked_cs.load(Ordering::Relaxed) {
            self.status.client_wait_on_cs.fetch_add(1, Ordering::Relaxed);
        }
        let cs = self.checkpoint_safe_lock.read();
        let mo = self.multi_operation_lock.read();
        CheckpointSafeGuard { _cs: cs, _mo: mo }
    }

    // -----------------------------------------------------------------------
    // The checkpoint itself
    // -----------------------------------------------------------------------

    fn set_footprint(&self, caller: CheckpointCaller, step: u64) {
        self.status
            .footprint
            .store(caller as u64 * 1000 + step, Ordering::Relaxed);
    }

    /// Take a checkpoint of every open cachefile.
    ///
    /// `callback` runs between begin and end with only the
    /// checkpoint-safe writer held; `callback2` runs after the pending
    /// pages are on disk, before the `end_checkpoint` record. Both are
    /// test/embedder hooks.
    pub fn checkpoint(
        &self,
        caller: CheckpointCaller,
        callback: Option<&(dyn Fn() + Sync)>,
        callback2: Option<&(dyn Fn() + Sync)>,
    ) -> Result<()> {
        self.status.waiters_now.fetch_add(1, Ordering::Relaxed);
        let cs_guard = self.checkpoint_safe_lock.write();
        self.locked_cs.store(true, Ordering::Relaxed);
        let waiters = self.status.waiters_now.fetch_sub(1, Ordering::Relaxed) - 1;
        self.status.waiters_max.fetch_max(waiters, Ordering::Relaxed);

        let result = self.checkpoint_locked(caller, callback, callback2);

        if let Err(err) = &result {
            self.status
                .checkpoint_count_fail
                .fetch_add(1, Ordering::Relaxed);
            warn!(caller = ?caller, error = %err, "checkpoint failed");
        }
        self.status.footprint.store(0, Ordering::Relaxed);
        self.locked_cs.store(false, Ordering::Relaxed);
        drop(cs_guard);
        result
    }

    fn checkpoint_locked(
        &self,
        caller: CheckpointCaller,
        callback: Option<&(dyn Fn() + Sync)>,
        callback2: Option<&(dyn Fn() + Sync)>,
    ) -> Result<()> {
        self.set_footprint(caller, 10);
        let lp_guard = self.low_priority_multi_operation_lock.write();
        let mo_guard = self.multi_operation_lock.write();
        self.locked_mo.store(true, Ordering::Relaxed);

        self.set_footprint(caller, 20);
        let oc_guard = self.cachetable.open_close_lock();

        self.set_footprint(caller, 30);
        self.status
            .time_last_begin
            .store(unix_now(), Ordering::Relaxed);
        let begin_started = Instant::now();
        let begin = self.begin_checkpoint();
        let begin_us = begin_started.elapsed().as_micros() as u64;

        drop(oc_guard);
        self.locked_mo.store(false, Ordering::Relaxed);
        drop(mo_guard);
        drop(lp_guard);
        let (begin_lsn, num_fassociate, num_xstillopen) = begin?;

        self.set_footprint(caller, 40);
        if let Some(cb) = callback {
            // Still under the checkpoint-safe writer.
            cb();
        }
        self.end_checkpoint(begin_lsn, num_fassociate, num_xstillopen, callback2)?;

        self.set_footprint(caller, 50);
        let trim_lsn = self.logger.last_completed_checkpoint_lsn();
        self.logger.maybe_trim_log(trim_lsn)?;
        self.status.last_lsn.store(trim_lsn.get(), Ordering::Relaxed);

        self.set_footprint(caller, 60);
        self.status
            .time_last_end
            .store(unix_now(), Ordering::Relaxed);
        self.status.time_last_begin_complete.store(
            self.status.time_last_begin.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.status.checkpoint_count.fetch_add(1, Ordering::Relaxed);
        self.status
            .begin_time_us
            .fetch_add(begin_us, Ordering::Relaxed);
        if begin_us >= self.long_begin_threshold_us.load(Ordering::Relaxed) {
            self.status
                .long_begin_time_us
                .fetch_add(begin_us, Ordering::Relaxed);
            self.status.long_begin_count.fetch_add(1, Ordering::Relaxed);
        }
        info!(caller = ?caller, begin_lsn = %begin_lsn, begin_us, "checkpoint complete");
        Ok(())
    }

    /// Checkpoint begin, engine side: under the three writers and the
    /// open/close lock, make the captured set definite. Logs
    /// `begin_checkpoint`, one `fassociate` per open cachefile, one
    /// `xstillopen`/`xstillopenprepared` per live logged transaction, and
    /// marks every dirty page pending at the begin LSN.
    fn begin_checkpoint(&self) -> Result<(Lsn, u32, u32)> {
        let manager: &Arc<TxnManager> = self.logger.txn_manager();
        let last_xid = manager.last_xid();
        let begin_lsn = self.logger.log(LogRecord::BeginCheckpoint {
            lsn: Lsn::ZERO,
            timestamp: unix_now(),
            last_xid,
        })?;

        let files = self.cachetable.list_open();
        let num_fassociate = files.len() as u32;
        for cf in &files {
            self.logger.log(LogRecord::Fassociate {
                lsn: Lsn::ZERO,
                filenum: cf.filenum(),
                treeflags: 0,
                iname: cf.iname().as_bytes().to_vec(),
                unlink_on_close: cf.unlink_on_close(),
            })?;
        }

        let mut num_xstillopen = 0_u32;
        for txn in manager.live_txns_all() {
            let inner = txn.inner();
            if !inner.begin_was_logged {
                continue;
            }
            if !matches!(inner.state, TxnState::Live | TxnState::Preparing) {
                continue;
            }
            let open_filenums = inner
                .open_dictionaries
                .iter()
                .map(|d| d.filenum())
                .collect();
            let record = if inner.state == TxnState::Preparing {
                LogRecord::XstillopenPrepared {
                    lsn: Lsn::ZERO,
                    xid: txn.txnid(),
                    xa_xid: inner.xa_xid,
                    rollentry_raw_count: inner.roll.rollentry_raw_count,
                    open_filenums,
                    force_fsync_on_commit: inner.force_fsync_on_commit,
                    num_rollback_nodes: inner.roll.num_rollback_nodes,
                    num_rollentries: inner.roll.num_rollentries,
                    spilled_rollback_head: inner.roll.spilled_rollback_head,
                    spilled_rollback_tail: inner.roll.spilled_rollback_tail,
                    current_rollback: inner.roll.current_rollback,
                }
            } else {
                LogRecord::Xstillopen {
                    lsn: Lsn::ZERO,
                    xid: txn.txnid(),
                    parent_xid: txn.parent().map_or(ftx_types::TxnidPair::NONE, |p| p.txnid()),
                    rollentry_raw_count: inner.roll.rollentry_raw_count,
                    open_filenums,
                    force_fsync_on_commit: inner.force_fsync_on_commit,
                    num_rollback_nodes: inner.roll.num_rollback_nodes,
                    num_rollentries: inner.roll.num_rollentries,
                    spilled_rollback_head: inner.roll.spilled_rollback_head,
                    spilled_rollback_tail: inner.roll.spilled_rollback_tail,
                    current_rollback: inner.roll.current_rollback,
                }
            };
            drop(inner);
            self.logger.log(record)?;
            num_xstillopen += 1;
        }

        self.cachetable.begin_checkpoint_pages(begin_lsn);
        Ok((begin_lsn, num_fassociate, num_xstillopen))
    }

    /// Checkpoint end: stream captured pages, fsync the data files, write
    /// `end_checkpoint`, fsync the log, and publish the completed LSN.
    fn end_checkpoint(
        &self,
        begin_lsn: Lsn,
        num_fassociate: u32,
        num_xstillopen: u32,
        callback2: Option<&(dyn Fn() + Sync)>,
    ) -> Result<()> {
        self.cachetable.end_checkpoint_pages()?;
        if let Some(cb) = callback2 {
            cb();
        }
        let end_lsn = self.logger.log(LogRecord::EndCheckpoint {
            lsn: Lsn::ZERO,
            lsn_begin_checkpoint: begin_lsn,
            timestamp: unix_now(),
            num_fassociate_entries: num_fassociate,
            num_xstillopen_entries: num_xstillopen,
        })?;
        self.logger.fsync_if_lsn_not_fsynced(end_lsn)?;
        self.logger.set_last_completed_checkpoint_lsn(begin_lsn);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduled checkpoints
// ---------------------------------------------------------------------------

/// Background thread taking a checkpoint every `period`. A zero period
/// disables scheduling entirely.
pub struct CheckpointScheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CheckpointScheduler {
    #[must_use]
    pub fn start(checkpointer: Arc<Checkpointer>, period: std::time::Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let handle = if period.is_zero() {
            None
        } else {
            let stop_for_thread = Arc::clone(&stop);
            Some(std::thread::spawn(move || {
                let (lock, cvar) = &*stop_for_thread;
                loop {
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cvar.wait_for(&mut stopped, period);
                    }
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    if let Err(err) =
                        checkpointer.checkpoint(CheckpointCaller::Scheduled, None, None)
                    {
                        warn!(error = %err, "scheduled checkpoint failed");
                    }
                }
            }))
        };
        Self { stop, handle }
    }

    /// Stop the scheduler and join the thread.
    pub fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
