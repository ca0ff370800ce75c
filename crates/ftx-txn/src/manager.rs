//! The process-wide transaction coordinator.
//!
//! One mutex protects the live-root set, the snapshot set, the
//! referenced-XID tuples, and the id counter; assigning an id and entering
//! the MVCC structures is one atomic step. State transitions out of
//! LIVE/PREPARING wait on a condition variable until the transaction's pin
//! count drains.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::debug;

use ftx_error::{FtxError, Result};
use ftx_types::{SnapshotType, Txnid, TxnidPair, TxnState, XaXid, Xids};

use crate::txn::Txn;

/// Tuple sizes below which snapshot teardown iterates the tuple set rather
/// than the (larger) live list.
const REFERENCED_XIDS_SMALL: usize = 2000;

// ---------------------------------------------------------------------------
// Status counters
// ---------------------------------------------------------------------------

/// Engine-status counters; intentionally relaxed, they are for humans.
#[derive(Default)]
pub struct TxnStatus {
    begin: AtomicU64,
    commit: AtomicU64,
    abort: AtomicU64,
    close: AtomicU64,
    num_open: AtomicU64,
    max_open: AtomicU64,
}

/// Point-in-time copy of [`TxnStatus`] for export.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TxnStatusSnapshot {
    pub begin: u64,
    pub commit: u64,
    pub abort: u64,
    pub close: u64,
    pub num_open: u64,
    pub max_open: u64,
}

impl TxnStatus {
    pub fn note_begin(&self) {
        self.begin.fetch_add(1, Ordering::Relaxed);
        let open = self.num_open.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_open.fetch_max(open, Ordering::Relaxed);
    }

    pub fn note_commit(&self) {
        self.commit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_abort(&self) {
        self.abort.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_close(&self) {
        self.close.fetch_add(1, Ordering::Relaxed);
        self.num_open.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TxnStatusSnapshot {
        TxnStatusSnapshot {
            begin: self.begin.load(Ordering::Relaxed),
            commit: self.commit.load(Ordering::Relaxed),
            abort: self.abort.load(Ordering::Relaxed),
            close: self.close.load(Ordering::Relaxed),
            num_open: self.num_open.load(Ordering::Relaxed),
            max_open: self.max_open.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Referenced-XID tuples
// ---------------------------------------------------------------------------

/// Bookkeeping for a completed root transaction still present in some
/// snapshot's live list. `begin_id` is the completed txn's id, `end_id`
/// the next id assigned at completion time, `references` the count of
/// still-live snapshots whose list holds `begin_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferencedXidTuple {
    pub begin_id: Txnid,
    pub end_id: Txnid,
    pub references: u32,
}

/// Consistent clone of the three MVCC structures, taken under the manager
/// lock and consumed lock-free by leaf-node garbage collection.
#[derive(Debug, Clone)]
pub struct GcState {
    /// Snapshot ids, ascending.
    pub snapshot_xids: Vec<Txnid>,
    /// Referenced tuples, ascending by `begin_id`.
    pub referenced_xids: Vec<ReferencedXidTuple>,
    /// Live root ids, ascending.
    pub live_root_ids: Vec<Txnid>,
}

impl GcState {
    /// For a key version written under completed txn `xc`: the youngest
    /// live snapshot that might still need to see it, or `NONE`.
    #[must_use]
    pub fn youngest_live_list_txnid_for(&self, xc: Txnid) -> Txnid {
        let Ok(idx) = self
            .referenced_xids
            .binary_search_by_key(&xc, |t| t.begin_id)
        else {
            return Txnid::NONE;
        };
        let tuple = &self.referenced_xids[idx];
        // Largest snapshot id strictly below end_id.
        let pos = self.snapshot_xids.partition_point(|&s| s < tuple.end_id);
        if pos == 0 {
            return Txnid::NONE;
        }
        let live = self.snapshot_xids[pos - 1];
        if live > tuple.begin_id {
            live
        } else {
            Txnid::NONE
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner {
    live_root_txns: BTreeMap<Txnid, Arc<Txn>>,
    /// Snapshot id → that snapshot's live-root list.
    snapshots: BTreeMap<Txnid, Arc<Vec<Txnid>>>,
    referenced_xids: BTreeMap<Txnid, ReferencedXidTuple>,
    last_xid: Txnid,
    last_xid_seen_for_recover: Txnid,
    last_calculated_oldest_referenced_xid: Txnid,
}

/// The transaction manager. One per engine instance.
pub struct TxnManager {
    inner: Mutex<ManagerInner>,
    /// Signalled by `unpin_live_txn`; `note_commit/abort` wait here.
    unpin_cvar: Condvar,
    status: TxnStatus,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

fn needs_snapshot(snapshot_type: SnapshotType, has_parent: bool) -> bool {
    snapshot_type != SnapshotType::None
        && (!has_parent || snapshot_type == SnapshotType::Child)
}

impl TxnManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                live_root_txns: BTreeMap::new(),
                snapshots: BTreeMap::new(),
                referenced_xids: BTreeMap::new(),
                last_xid: Txnid::NONE,
                last_xid_seen_for_recover: Txnid::NONE,
                last_calculated_oldest_referenced_xid: Txnid::NONE,
            }),
            unpin_cvar: Condvar::new(),
            status: TxnStatus::default(),
        }
    }

    #[must_use]
    pub fn status(&self) -> &TxnStatus {
        &self.status
    }

    // -----------------------------------------------------------------------
    // Begin
    // -----------------------------------------------------------------------

    /// Start a transaction: assign ids, enter the live-root set, and take
    /// the snapshot, all atomically.
    ///
    /// During recovery (`for_recovery_xid` set) the replayed id is used and
    /// the counter is bumped to at least match; replay may see ids out of
    /// order.
    pub fn start_txn(
        &self,
        parent: Option<Arc<Txn>>,
        snapshot_type: SnapshotType,
        read_only: bool,
        for_recovery_xid: Option<TxnidPair>,
    ) -> Result<Arc<Txn>> {
        if let Some(p) = parent.as_ref() {
            if p.state() != TxnState::Live {
                return Err(FtxError::Invalid(
                    "parent transaction is not live".to_owned(),
                ));
            }
        }

        let mut inner = self.inner.lock();
        let take_snapshot = for_recovery_xid.is_none()
            && needs_snapshot(snapshot_type, parent.is_some());

        let txn = match parent {
            None => {
                let xid = match for_recovery_xid {
                    Some(pair) => {
                        inner.last_xid = inner.last_xid.max(pair.parent_id64);
                        pair.parent_id64
                    }
                    None => {
                        inner.last_xid = Txnid(inner.last_xid.get() + 1);
                        inner.last_xid
                    }
                };
                let txnid = TxnidPair::root(xid);

                let (snapshot_txnid, live_list) = if take_snapshot {
                    inner.last_xid = Txnid(inner.last_xid.get() + 1);
                    let snap_id = inner.last_xid;
                    // The transaction enters the live-root set before the
                    // list is cloned, so a root snapshot txn is in its own
                    // live list (close accounts for this).
                    let mut ids: Vec<Txnid> = inner.live_root_txns.keys().copied().collect();
                    if !read_only {
                        ids.push(xid);
                    }
                    (snap_id, Some(Arc::new(ids)))
                } else {
                    (Txnid::NONE, None)
                };

                let txn = Txn::new(
                    txnid,
                    xid,
                    snapshot_txnid,
                    snapshot_type,
                    Xids::root().push_child(xid),
                    None,
                    live_list.clone(),
                    read_only,
                    for_recovery_xid.is_some(),
                );
                if !read_only {
                    if inner.live_root_txns.insert(xid, Arc::clone(&txn)).is_some() {
                        return Err(FtxError::internal(format!(
                            "txnid {xid} already live"
                        )));
                    }
                }
                if let Some(list) = live_list {
                    inner.snapshots.insert(snapshot_txnid, list);
                }
                txn
            }
            Some(parent) => {
                let child_id = match for_recovery_xid {
                    Some(pair) => {
                        inner.last_xid = inner.last_xid.max(pair.own_id());
                        pair.own_id()
                    }
                    None => {
                        inner.last_xid = Txnid(inner.last_xid.get() + 1);
                        inner.last_xid
                    }
                };
                let txnid = TxnidPair::child(parent.root_txnid(), child_id);

                let (snapshot_txnid, live_list) = if take_snapshot {
                    inner.last_xid = Txnid(inner.last_xid.get() + 1);
                    let snap_id = inner.last_xid;
                    let ids: Vec<Txnid> = inner.live_root_txns.keys().copied().collect();
                    (snap_id, Some(Arc::new(ids)))
                } else {
                    // Inherit the parent's snapshot; the list is shared,
                    // not owned.
                    (
                        parent.snapshot_txnid(),
                        parent.live_root_txn_list().cloned(),
                    )
                };

                let txn = Txn::new(
                    txnid,
                    parent.root_txnid(),
                    snapshot_txnid,
                    snapshot_type,
                    parent.xids().push_child(child_id),
                    Some(Arc::clone(&parent)),
                    live_list.clone(),
                    read_only,
                    for_recovery_xid.is_some(),
                );
                if take_snapshot {
                    if let Some(list) = live_list {
                        inner.snapshots.insert(snapshot_txnid, list);
                    }
                }
                parent.inner().children.push(Arc::clone(&txn));
                txn
            }
        };

        Self::set_oldest_referenced_xid(&mut inner);
        drop(inner);

        self.status.note_begin();
        debug!(txnid = %txn.txnid(), snapshot = %txn.snapshot_txnid(), "txn started");
        Ok(txn)
    }

    fn set_oldest_referenced_xid(inner: &mut ManagerInner) {
        let mut oldest = Txnid::MAX;
        if let Some((&id, _)) = inner.live_root_txns.first_key_value() {
            oldest = oldest.min(id);
        }
        if let Some((_, tuple)) = inner.referenced_xids.first_key_value() {
            oldest = oldest.min(tuple.begin_id);
        }
        if let Some((&id, _)) = inner.snapshots.first_key_value() {
            oldest = oldest.min(id);
        }
        oldest = oldest.min(inner.last_xid);
        inner.last_calculated_oldest_referenced_xid = oldest;
    }

    /// Cached estimate of the oldest id any reader might still reference.
    /// Leaf-node GC reads this without taking the manager lock.
    #[must_use]
    pub fn oldest_referenced_xid_estimate(&self) -> Txnid {
        self.inner.lock().last_calculated_oldest_referenced_xid
    }

    // -----------------------------------------------------------------------
    // Finish / snapshot teardown
    // -----------------------------------------------------------------------

    /// Remove a completed root transaction. If still-live snapshots hold
    /// it in their live lists, record a referenced-XID tuple so MVCC GC
    /// knows when its versions become collectible.
    pub fn finish_txn(&self, txn: &Arc<Txn>) -> Result<()> {
        if txn.parent().is_some() {
            return Err(FtxError::internal("finish_txn called on a child"));
        }
        let mut inner = self.inner.lock();

        if needs_snapshot(txn.snapshot_type(), false) {
            let list = txn
                .live_root_txn_list()
                .ok_or_else(|| FtxError::internal("snapshot txn without live list"))?
                .clone();
            Self::remove_snapshot_locked(&mut inner, txn.snapshot_txnid(), &list);
        }

        if !txn.declared_read_only() {
            let root_id = txn.root_txnid();
            if inner.live_root_txns.remove(&root_id).is_none() {
                return Err(FtxError::internal(format!(
                    "txnid {root_id} missing from live-root set"
                )));
            }

            if !txn.is_read_only() {
                // Snapshots created after this txn began have ids above it
                // and captured it live.
                let references = inner
                    .snapshots
                    .range((Bound::Excluded(root_id), Bound::Unbounded))
                    .count() as u32;
                if references > 0 {
                    inner.last_xid = Txnid(inner.last_xid.get() + 1);
                    let tuple = ReferencedXidTuple {
                        begin_id: root_id,
                        end_id: inner.last_xid,
                        references,
                    };
                    inner.referenced_xids.insert(root_id, tuple);
                    debug!(
                        begin = %root_id,
                        end = %tuple.end_id,
                        references,
                        "referenced-xid tuple recorded"
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop a snapshot and release its references on completed txns.
    ///
    /// Two strategies, picked by side size as in the original: iterate the
    /// tuple set when it is the smaller side, else iterate the live list.
    fn remove_snapshot_locked(inner: &mut ManagerInner, snapshot_id: Txnid, live_list: &[Txnid]) {
        inner.snapshots.remove(&snapshot_id);
        if inner.referenced_xids.is_empty() || live_list.is_empty() {
            return;
        }
        if live_list.len() > inner.referenced_xids.len()
            && inner.referenced_xids.len() < REFERENCED_XIDS_SMALL
        {
            let mut dead: Vec<Txnid> = Vec::new();
            for (begin, tuple) in &mut inner.referenced_xids {
                if live_list.binary_search(begin).is_ok() {
                    tuple.references -= 1;
                    if tuple.references == 0 {
                        dead.push(*begin);
                    }
                }
            }
            for begin in dead {
                inner.referenced_xids.remove(&begin);
            }
        } else {
            for xid in live_list {
                let drained = inner.referenced_xids.get_mut(xid).is_some_and(|tuple| {
                    tuple.references -= 1;
                    tuple.references == 0
                });
                if drained {
                    inner.referenced_xids.remove(xid);
                }
            }
        }
    }

    /// Snapshot teardown for a child that took its own snapshot.
    pub fn handle_snapshot_destroy_for_child_txn(&self, txn: &Arc<Txn>) {
        debug_assert!(txn.parent().is_some());
        if txn.snapshot_type() != SnapshotType::Child {
            return;
        }
        if let Some(list) = txn.live_root_txn_list() {
            let list = Arc::clone(list);
            let mut inner = self.inner.lock();
            Self::remove_snapshot_locked(&mut inner, txn.snapshot_txnid(), &list);
        }
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Mark a root transaction PREPARING. It stays in the live-root set;
    /// XA recovery walks that set looking for prepared entries.
    pub fn add_prepared_txn(&self, txn: &Arc<Txn>) -> Result<()> {
        let _inner = self.inner.lock();
        let mut ti = txn.inner();
        if ti.state != TxnState::Live {
            return Err(FtxError::Invalid(format!(
                "prepare in state {:?}",
                ti.state
            )));
        }
        ti.state = TxnState::Preparing;
        Ok(())
    }

    fn transition_out_of_live(&self, txn: &Arc<Txn>, next: TxnState) -> Result<TxnState> {
        let mut inner = self.inner.lock();
        loop {
            let mut ti = txn.inner();
            if !matches!(ti.state, TxnState::Live | TxnState::Preparing) {
                return Err(FtxError::Invalid(format!(
                    "state transition from {:?}",
                    ti.state
                )));
            }
            if ti.num_pin == 0 {
                let prior = ti.state;
                ti.state = next;
                return Ok(prior);
            }
            drop(ti);
            self.unpin_cvar.wait(&mut inner);
        }
    }

    /// LIVE/PREPARING → COMMITTING, waiting for the pin count to drain.
    /// Returns the prior state (prepared commits skip the fsync).
    pub fn note_commit_txn(&self, txn: &Arc<Txn>) -> Result<TxnState> {
        self.transition_out_of_live(txn, TxnState::Committing)
    }

    /// LIVE/PREPARING → ABORTING, waiting for the pin count to drain.
    pub fn note_abort_txn(&self, txn: &Arc<Txn>) -> Result<TxnState> {
        self.transition_out_of_live(txn, TxnState::Aborting)
    }

    /// Block state transitions of a live transaction (used by online index
    /// build while it holds a leaf-entry reference).
    pub fn pin_live_txn(&self, txn: &Arc<Txn>) -> Result<()> {
        let _inner = self.inner.lock();
        let mut ti = txn.inner();
        if !matches!(ti.state, TxnState::Live | TxnState::Preparing) {
            return Err(FtxError::Invalid(format!(
                "pin in state {:?}",
                ti.state
            )));
        }
        ti.num_pin += 1;
        Ok(())
    }

    /// Release a pin; wakes any waiting committer/aborter.
    pub fn unpin_live_txn(&self, txn: &Arc<Txn>) {
        let _inner = self.inner.lock();
        let mut ti = txn.inner();
        debug_assert!(ti.num_pin > 0);
        ti.num_pin -= 1;
        drop(ti);
        self.unpin_cvar.notify_all();
    }

    // -----------------------------------------------------------------------
    // Lookups and iteration
    // -----------------------------------------------------------------------

    /// O(log n) lookup of a live root transaction by id.
    #[must_use]
    pub fn id2txn(&self, txnid: Txnid) -> Option<Arc<Txn>> {
        self.inner.lock().live_root_txns.get(&txnid).cloned()
    }

    /// Lookup by pair: the root, or a descendant carrying the child id.
    #[must_use]
    pub fn id2txn_pair(&self, txnid: TxnidPair) -> Option<Arc<Txn>> {
        let root = self.id2txn(txnid.parent_id64)?;
        if txnid.is_root() {
            return Some(root);
        }
        fn find_child(txn: &Arc<Txn>, child_id: Txnid) -> Option<Arc<Txn>> {
            for child in txn.inner().children.clone() {
                if child.txnid().child_id64 == child_id {
                    return Some(child);
                }
                if let Some(found) = find_child(&child, child_id) {
                    return Some(found);
                }
            }
            None
        }
        find_child(&root, txnid.child_id64)
    }

    /// Linear scan of live roots by XA xid. Used only by XA recovery.
    #[must_use]
    pub fn get_root_txn_from_xa_xid(&self, xa_xid: &XaXid) -> Option<Arc<Txn>> {
        let inner = self.inner.lock();
        inner
            .live_root_txns
            .values()
            .find(|t| t.prepared_xa_xid() == *xa_xid)
            .cloned()
    }

    /// Snapshot of the live roots, ascending by id.
    #[must_use]
    pub fn live_root_txns(&self) -> Vec<Arc<Txn>> {
        self.inner.lock().live_root_txns.values().cloned().collect()
    }

    /// Live roots and every descendant, roots ascending.
    #[must_use]
    pub fn live_txns_all(&self) -> Vec<Arc<Txn>> {
        fn collect(txn: &Arc<Txn>, out: &mut Vec<Arc<Txn>>) {
            out.push(Arc::clone(txn));
            for child in txn.inner().children.clone() {
                collect(&child, out);
            }
        }
        let roots = self.live_root_txns();
        let mut out = Vec::new();
        for root in &roots {
            collect(root, &mut out);
        }
        out
    }

    #[must_use]
    pub fn num_live_root_txns(&self) -> usize {
        self.inner.lock().live_root_txns.len()
    }

    #[must_use]
    pub fn txns_exist(&self) -> bool {
        self.num_live_root_txns() > 0
    }

    /// Whether `txnid` is a currently live root.
    #[must_use]
    pub fn is_txnid_live(&self, txnid: Txnid) -> bool {
        self.inner.lock().live_root_txns.contains_key(&txnid)
    }

    // -----------------------------------------------------------------------
    // XA recovery cursor
    // -----------------------------------------------------------------------

    /// Return prepared transactions in txnid order, up to `max`. `first`
    /// restarts the scan; otherwise it continues past the last id handed
    /// out. A short result means the list is exhausted.
    #[must_use]
    pub fn recover_root_txns(&self, first: bool, max: usize) -> Vec<Arc<Txn>> {
        let mut inner = self.inner.lock();
        if first {
            inner.last_xid_seen_for_recover = Txnid::NONE;
        }
        let mut out = Vec::new();
        let start = inner.last_xid_seen_for_recover;
        let mut last_seen = start;
        for (&id, txn) in inner
            .live_root_txns
            .range((Bound::Excluded(start), Bound::Unbounded))
        {
            last_seen = id;
            if txn.state() == TxnState::Preparing {
                out.push(Arc::clone(txn));
            }
            if out.len() >= max {
                break;
            }
        }
        inner.last_xid_seen_for_recover = last_seen;
        out
    }

    // -----------------------------------------------------------------------
    // GC support
    // -----------------------------------------------------------------------

    /// Atomically clone the three MVCC structures.
    #[must_use]
    pub fn clone_state_for_gc(&self) -> GcState {
        let inner = self.inner.lock();
        GcState {
            snapshot_xids: inner.snapshots.keys().copied().collect(),
            referenced_xids: inner.referenced_xids.values().copied().collect(),
            live_root_ids: inner.live_root_txns.keys().copied().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Id counter plumbing
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn last_xid(&self) -> Txnid {
        self.inner.lock().last_xid
    }

    /// Recovery saw a checkpoint's `last_xid`; adopt it.
    pub fn set_last_xid_from_recovered_checkpoint(&self, last_xid: Txnid) {
        let mut inner = self.inner.lock();
        inner.last_xid = inner.last_xid.max(last_xid);
    }

    /// Test-only: advance the id counter.
    pub fn increase_last_xid(&self, increment: u64) {
        let mut inner = self.inner.lock();
        inner.last_xid = Txnid(inner.last_xid.get() + increment);
    }
}
