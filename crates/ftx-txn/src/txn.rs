//! One transaction: identity, nesting, snapshot descriptor, undo-chain
//! bookkeeping, and the lifecycle entry points (lazy xbegin, prepare,
//! commit, abort, close).
//!
//! State transitions are driven by the transaction manager under its lock;
//! nothing here mutates `TxnState` directly.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use ftx_error::{FtxError, Result};
use ftx_log::LogRecord;
use ftx_types::{Blocknum, Filenum, Lsn, SnapshotType, Txnid, TxnidPair, TxnState, XaXid, Xids};

use crate::logger::Logger;
use crate::rollback_apply::{self, RollbackTarget};

// ---------------------------------------------------------------------------
// Open-dictionary capability
// ---------------------------------------------------------------------------

/// A dictionary handle a transaction has touched. The transaction keeps the
/// set so every dictionary hears about the transaction going away at close
/// (clearing created-by / suppress-rollback marks).
pub trait OpenDictionary: Send + Sync {
    fn filenum(&self) -> Filenum;
    fn note_txn_closing(&self, txnid: TxnidPair);
}

// ---------------------------------------------------------------------------
// Progress polling
// ---------------------------------------------------------------------------

/// Progress report handed to the optional poll callback every 1024
/// processed roll entries, so slow aborts can report to the caller.
#[derive(Debug, Clone, Copy)]
pub struct TxnProgress {
    pub entries_total: u64,
    pub entries_processed: u64,
    pub is_commit: bool,
    pub stalled_on_checkpoint: bool,
}

/// Poll callback type used by commit/abort.
pub type ProgressPoll<'a> = &'a (dyn Fn(&TxnProgress) + Send + Sync);

// ---------------------------------------------------------------------------
// Rollback bookkeeping
// ---------------------------------------------------------------------------

/// The transaction's view of its undo chain.
#[derive(Debug, Clone)]
pub struct TxnRollInfo {
    pub num_rollback_nodes: u64,
    pub num_rollentries: u64,
    pub num_rollentries_processed: u64,
    pub rollentry_raw_count: u64,
    pub spilled_rollback_head: Blocknum,
    pub spilled_rollback_tail: Blocknum,
    pub current_rollback: Blocknum,
}

impl Default for TxnRollInfo {
    fn default() -> Self {
        Self {
            num_rollback_nodes: 0,
            num_rollentries: 0,
            num_rollentries_processed: 0,
            rollentry_raw_count: 0,
            spilled_rollback_head: Blocknum::ROLLBACK_NONE,
            spilled_rollback_tail: Blocknum::ROLLBACK_NONE,
            current_rollback: Blocknum::ROLLBACK_NONE,
        }
    }
}

impl TxnRollInfo {
    #[must_use]
    pub fn has_current(&self) -> bool {
        !self.current_rollback.is_none()
    }

    #[must_use]
    pub fn has_spilled(&self) -> bool {
        !self.spilled_rollback_tail.is_none()
    }
}

/// Recovered transaction state from an `xstillopen` record.
pub struct TxnInfo {
    pub rollentry_raw_count: u64,
    pub open_dictionaries: Vec<Arc<dyn OpenDictionary>>,
    pub force_fsync_on_commit: bool,
    pub num_rollback_nodes: u64,
    pub num_rollentries: u64,
    pub spilled_rollback_head: Blocknum,
    pub spilled_rollback_tail: Blocknum,
    pub current_rollback: Blocknum,
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// Mutable transaction state, behind the txn lock.
pub struct TxnInner {
    pub state: TxnState,
    pub begin_was_logged: bool,
    pub checkpoint_needed_before_commit: bool,
    pub do_fsync: bool,
    pub force_fsync_on_commit: bool,
    pub do_fsync_lsn: Lsn,
    pub xa_xid: XaXid,
    pub num_pin: u64,
    pub open_dictionaries: Vec<Arc<dyn OpenDictionary>>,
    pub children: Vec<Arc<Txn>>,
    pub roll: TxnRollInfo,
}

/// One transaction. Identity and snapshot descriptor are fixed at begin
/// (they are assigned atomically under the manager lock); everything else
/// lives behind the txn lock.
pub struct Txn {
    txnid: TxnidPair,
    ancestor_txnid64: Txnid,
    snapshot_txnid64: Txnid,
    snapshot_type: SnapshotType,
    xids: Xids,
    parent: Option<Arc<Txn>>,
    /// Root-txn ids live at snapshot time. Owned clone for transactions
    /// with their own snapshot; a shared handle to the parent's list for
    /// root-type children.
    live_root_txn_list: Option<Arc<Vec<Txnid>>>,
    declared_read_only: bool,
    for_recovery: bool,
    inner: Mutex<TxnInner>,
}

impl Txn {
    /// Construct a transaction. Only the manager calls this, under its
    /// lock, with identity already assigned.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        txnid: TxnidPair,
        ancestor_txnid64: Txnid,
        snapshot_txnid64: Txnid,
        snapshot_type: SnapshotType,
        xids: Xids,
        parent: Option<Arc<Txn>>,
        live_root_txn_list: Option<Arc<Vec<Txnid>>>,
        declared_read_only: bool,
        for_recovery: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            txnid,
            ancestor_txnid64,
            snapshot_txnid64,
            snapshot_type,
            xids,
            parent,
            live_root_txn_list,
            declared_read_only,
            for_recovery,
            inner: Mutex::new(TxnInner {
                state: TxnState::Live,
                begin_was_logged: false,
                checkpoint_needed_before_commit: false,
                do_fsync: false,
                force_fsync_on_commit: false,
                do_fsync_lsn: Lsn::ZERO,
                xa_xid: XaXid::invalid(),
                num_pin: 0,
                open_dictionaries: Vec::new(),
                children: Vec::new(),
                roll: TxnRollInfo::default(),
            }),
        })
    }

    #[must_use]
    pub fn txnid(&self) -> TxnidPair {
        self.txnid
    }

    #[must_use]
    pub fn root_txnid(&self) -> Txnid {
        self.ancestor_txnid64
    }

    #[must_use]
    pub fn snapshot_txnid(&self) -> Txnid {
        self.snapshot_txnid64
    }

    #[must_use]
    pub fn snapshot_type(&self) -> SnapshotType {
        self.snapshot_type
    }

    #[must_use]
    pub fn xids(&self) -> &Xids {
        &self.xids
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Txn>> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn declared_read_only(&self) -> bool {
        self.declared_read_only
    }

    #[must_use]
    pub fn for_recovery(&self) -> bool {
        self.for_recovery
    }

    #[must_use]
    pub fn live_root_txn_list(&self) -> Option<&Arc<Vec<Txnid>>> {
        self.live_root_txn_list.as_ref()
    }

    pub fn inner(&self) -> MutexGuard<'_, TxnInner> {
        self.inner.lock()
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Whether `xid` was live when this transaction's snapshot was taken
    /// (and therefore invisible to it).
    #[must_use]
    pub fn is_txnid_in_live_root_txn_list(&self, xid: Txnid) -> bool {
        self.live_root_txn_list
            .as_ref()
            .is_some_and(|list| list.binary_search(&xid).is_ok())
    }

    /// Oldest root id in the snapshot's live list.
    #[must_use]
    pub fn oldest_in_live_root_txn_list(&self) -> Option<Txnid> {
        self.live_root_txn_list
            .as_ref()
            .and_then(|list| list.first().copied())
    }

    /// A transaction that never logged `xbegin` wrote nothing: it closes
    /// without commit/abort records and without fsync.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        let inner = self.inner.lock();
        if !inner.begin_was_logged {
            debug_assert_eq!(inner.roll.num_rollentries, 0);
            debug_assert!(inner.do_fsync_lsn.is_zero());
            debug_assert!(inner.open_dictionaries.is_empty());
            debug_assert_eq!(inner.num_pin, 0);
            return true;
        }
        false
    }

    /// Record that this transaction touched `dict`, once.
    pub fn maybe_note_dictionary(&self, dict: &Arc<dyn OpenDictionary>) {
        let mut inner = self.inner.lock();
        if !inner
            .open_dictionaries
            .iter()
            .any(|d| d.filenum() == dict.filenum())
        {
            inner.open_dictionaries.push(Arc::clone(dict));
        }
    }

    pub fn set_force_fsync_on_commit(&self) {
        self.inner.lock().force_fsync_on_commit = true;
    }

    /// Ask for a checkpoint before this transaction's commit record.
    pub fn require_checkpoint_on_commit(&self) {
        self.inner.lock().checkpoint_needed_before_commit = true;
    }

    #[must_use]
    pub fn requires_checkpoint(&self) -> bool {
        self.parent.is_none() && self.inner.lock().checkpoint_needed_before_commit
    }

    /// Fsync intent set by commit/prepare; the caller performs the fsync
    /// after releasing its locks.
    #[must_use]
    pub fn fsync_info(&self) -> (bool, Lsn) {
        let inner = self.inner.lock();
        (inner.do_fsync, inner.do_fsync_lsn)
    }

    /// The prepared XA identifier.
    #[must_use]
    pub fn prepared_xa_xid(&self) -> XaXid {
        self.inner.lock().xa_xid
    }

    /// Emit `xbegin` for this transaction (ancestors first) if it has not
    /// been logged yet. Idempotent; called on the first write operation.
    pub fn maybe_log_begin_for_write_operation(self: &Arc<Self>, logger: &Logger) -> Result<()> {
        let mut chain: Vec<Arc<Txn>> = Vec::new();
        let mut cursor = Some(Arc::clone(self));
        while let Some(txn) = cursor {
            cursor = txn.parent().cloned();
            chain.push(txn);
        }
        // Ancestors cannot run while a child works, so the child's lock is
        // enough for the whole chain.
        for txn in chain.iter().rev() {
            let mut inner = txn.inner();
            if inner.begin_was_logged {
                continue;
            }
            let parent_xid = txn.parent().map_or(TxnidPair::NONE, |p| p.txnid());
            logger.log(LogRecord::Xbegin {
                lsn: Lsn::ZERO,
                xid: txn.txnid(),
                parent_xid,
            })?;
            inner.begin_was_logged = true;
        }
        Ok(())
    }

    /// Restore state from a checkpoint's `xstillopen` record during
    /// recovery.
    pub fn load_txninfo(&self, info: TxnInfo) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.roll.rollentry_raw_count = info.rollentry_raw_count;
        inner.force_fsync_on_commit = info.force_fsync_on_commit;
        inner.roll.num_rollback_nodes = info.num_rollback_nodes;
        inner.roll.num_rollentries = info.num_rollentries;
        inner.roll.spilled_rollback_head = info.spilled_rollback_head;
        inner.roll.spilled_rollback_tail = info.spilled_rollback_tail;
        inner.roll.current_rollback = info.current_rollback;
        drop(inner);
        for dict in info.open_dictionaries {
            self.maybe_note_dictionary(&dict);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("txnid", &self.txnid)
            .field("snapshot_txnid", &self.snapshot_txnid64)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle operations
// ---------------------------------------------------------------------------

/// Prepare a root transaction for two-phase commit: record the XA xid,
/// move LIVE→PREPARING, and log `xprepare`. Children and read-only
/// transactions are a no-op (XA guarantees are free for them).
///
/// The caller fsyncs afterwards using [`Txn::fsync_info`].
pub fn prepare_txn(txn: &Arc<Txn>, logger: &Logger, xa_xid: &XaXid) -> Result<()> {
    if txn.parent().is_some() || txn.is_read_only() {
        return Ok(());
    }
    logger.txn_manager().add_prepared_txn(txn)?;
    {
        let mut inner = txn.inner();
        inner.do_fsync = inner.force_fsync_on_commit || inner.roll.num_rollentries > 0;
        inner.xa_xid = *xa_xid;
    }
    let lsn = logger.log(LogRecord::Xprepare {
        lsn: Lsn::ZERO,
        xid: txn.txnid(),
        xa_xid: *xa_xid,
    })?;
    txn.inner().do_fsync_lsn = lsn;
    debug!(txnid = %txn.txnid(), "txn prepared");
    Ok(())
}

/// Commit: transition to COMMITTING (waiting out pins), log `xcommit`
/// unless read-only, then walk the rollback chain applying commit handlers
/// (or promote to the parent for a child).
///
/// `oplsn` is `ZERO` in normal operation and the replayed record's LSN
/// during recovery.
pub fn commit_txn_with_lsn(
    txn: &Arc<Txn>,
    logger: &Logger,
    target: &dyn RollbackTarget,
    nosync: bool,
    oplsn: Lsn,
    poll: Option<ProgressPoll<'_>>,
) -> Result<()> {
    let prior = logger.txn_manager().note_commit_txn(txn)?;
    let was_prepared = prior == TxnState::Preparing;
    let read_only = txn.is_read_only();
    {
        let mut inner = txn.inner();
        // Children never fsync (the root's sync covers them) and a
        // previously prepared txn already fsynced at prepare time.
        inner.do_fsync = txn.is_root()
            && !was_prepared
            && (inner.force_fsync_on_commit || (!nosync && inner.roll.num_rollentries > 0));
    }
    if !read_only {
        let lsn = logger.log(LogRecord::Xcommit {
            lsn: Lsn::ZERO,
            xid: txn.txnid(),
        })?;
        txn.inner().do_fsync_lsn = lsn;
    }
    // Even when nothing was written the walk is cheap and keeps the
    // cleanup in one place.
    rollback_apply::rollback_commit(txn, logger, target, oplsn, poll)?;
    logger.txn_manager().status().note_commit();
    Ok(())
}

/// Abort: transition to ABORTING, log `xabort` unless read-only, then walk
/// the rollback chain applying abort handlers.
pub fn abort_txn_with_lsn(
    txn: &Arc<Txn>,
    logger: &Logger,
    target: &dyn RollbackTarget,
    oplsn: Lsn,
    poll: Option<ProgressPoll<'_>>,
) -> Result<()> {
    logger.txn_manager().note_abort_txn(txn)?;
    txn.inner().do_fsync = false;
    if !txn.is_read_only() {
        let lsn = logger.log(LogRecord::Xabort {
            lsn: Lsn::ZERO,
            xid: txn.txnid(),
        })?;
        txn.inner().do_fsync_lsn = lsn;
    }
    rollback_apply::rollback_abort(txn, logger, target, oplsn, poll)?;
    logger.txn_manager().status().note_abort();
    Ok(())
}

/// Remove the transaction from the manager's structures, notify touched
/// dictionaries, and retire the object. Called after commit or abort.
pub fn complete_txn(txn: &Arc<Txn>, logger: &Logger) -> Result<()> {
    {
        let inner = txn.inner();
        if inner.roll.has_current() || inner.roll.has_spilled() {
            return Err(FtxError::internal("closing txn with live rollback chain"));
        }
        if inner.num_pin != 0 {
            return Err(FtxError::internal("closing txn with outstanding pins"));
        }
        if !matches!(inner.state, TxnState::Committing | TxnState::Aborting) {
            return Err(FtxError::internal(format!(
                "closing txn in state {:?}",
                inner.state
            )));
        }
        if !inner.children.is_empty() {
            return Err(FtxError::internal("closing txn with live children"));
        }
    }

    if let Some(parent) = txn.parent() {
        parent
            .inner()
            .children
            .retain(|c| c.txnid() != txn.txnid());
        if txn.snapshot_type() == SnapshotType::Child {
            logger
                .txn_manager()
                .handle_snapshot_destroy_for_child_txn(txn);
        }
    } else {
        logger.txn_manager().finish_txn(txn)?;
    }

    let dictionaries: Vec<Arc<dyn OpenDictionary>> =
        std::mem::take(&mut txn.inner().open_dictionaries);
    for dict in dictionaries {
        dict.note_txn_closing(txn.txnid());
    }

    txn.inner().state = TxnState::Retired;
    logger.txn_manager().status().note_close();
    debug!(txnid = %txn.txnid(), "txn closed");
    Ok(())
}

/// Maybe fsync the log for a just-committed/prepared transaction.
pub fn maybe_fsync_log(logger: &Logger, do_fsync_lsn: Lsn, do_fsync: bool) -> Result<()> {
    if do_fsync {
        logger.fsync_if_lsn_not_fsynced(do_fsync_lsn)?;
    }
    Ok(())
}
