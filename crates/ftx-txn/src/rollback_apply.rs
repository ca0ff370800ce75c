//! Commit/abort application of a transaction's rollback chain, and the
//! child→parent promotion that happens when a nested transaction commits.
//!
//! The walk runs newest to oldest: the current node first, then the
//! spilled chain from tail to head. Every pin re-verifies ownership and
//! the strictly-decrementing sequence; the walk ends when sequence zero is
//! reached at the spilled head.

use std::sync::Arc;

use tracing::debug;

use ftx_cachetable::Cachefile;
use ftx_error::{FtxError, Result};
use ftx_types::{Blocknum, Filenum, Lsn, TxnidPair, Xids};

use crate::logger::Logger;
use crate::rollback::{
    RollEntry, RollbackLog, get_and_pin_rollback_log_for_new_entry, maybe_spill,
    prefetch_previous, save_rollback, unpin_and_remove, verify_contents,
};
use crate::txn::{ProgressPoll, Txn, TxnProgress};

/// Entries between progress polls.
const PROGRESS_POLL_PERIOD: u64 = 1024;

// ---------------------------------------------------------------------------
// Rollback target capability
// ---------------------------------------------------------------------------

/// The index-layer operations rollback application needs. Supplied by the
/// engine at commit/abort time; handlers receive the applying
/// transaction's XIDS stack, which prefix-matches every descendant's
/// versions.
pub trait RollbackTarget: Send + Sync {
    /// Undo a point insert: remove the writer's version of `key`.
    fn undo_insert(&self, filenum: Filenum, key: &[u8], xids: &Xids, oplsn: Lsn) -> Result<()>;
    /// Undo a point delete: remove the writer's tombstone of `key`.
    fn undo_delete(&self, filenum: Filenum, key: &[u8], xids: &Xids, oplsn: Lsn) -> Result<()>;
    /// Undo an update: remove the writer's version of `key`.
    fn undo_update(&self, filenum: Filenum, key: &[u8], xids: &Xids, oplsn: Lsn) -> Result<()>;
    /// Undo a broadcast update across the dictionary.
    fn undo_update_broadcast(&self, filenum: Filenum, xids: &Xids, oplsn: Lsn) -> Result<()>;
    /// Commit side of `fdelete`: the unlink becomes final.
    fn commit_file_delete(&self, filenum: Filenum, iname: &[u8], oplsn: Lsn) -> Result<()>;
    /// Abort side of `fcreate`: the file never existed.
    fn abort_file_create(&self, filenum: Filenum, iname: &[u8], oplsn: Lsn) -> Result<()>;
    /// Abort side of a rename: restore the old name.
    fn abort_file_rename(
        &self,
        filenum: Filenum,
        old_iname: &[u8],
        new_iname: &[u8],
        oplsn: Lsn,
    ) -> Result<()>;
    /// Commit side of a bulk load: unlink the replaced file.
    fn commit_load(&self, old_iname: &[u8], oplsn: Lsn) -> Result<()>;
    /// Abort side of a bulk load: unlink the abandoned new file.
    fn abort_load(&self, new_iname: &[u8], oplsn: Lsn) -> Result<()>;
    /// Abort side of a descriptor change: restore the old descriptor.
    fn abort_change_descriptor(
        &self,
        filenum: Filenum,
        old_descriptor: &[u8],
        oplsn: Lsn,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Per-entry dispatch
// ---------------------------------------------------------------------------

struct ApplyCtx<'a> {
    txn: &'a Arc<Txn>,
    logger: &'a Logger,
    target: &'a dyn RollbackTarget,
    lsn: Lsn,
    is_commit: bool,
    poll: Option<ProgressPoll<'a>>,
}

impl ApplyCtx<'_> {
    fn poll_progress(&self) {
        let Some(poll) = self.poll else { return };
        let inner = self.txn.inner();
        let progress = TxnProgress {
            entries_total: inner.roll.num_rollentries,
            entries_processed: inner.roll.num_rollentries_processed,
            is_commit: self.is_commit,
            stalled_on_checkpoint: false,
        };
        drop(inner);
        poll(&progress);
    }

    fn apply_one(&self, entry: &RollEntry) -> Result<()> {
        let xids = self.txn.xids();
        if self.is_commit {
            match entry {
                RollEntry::FileDelete { filenum, iname } => {
                    self.target.commit_file_delete(*filenum, iname, self.lsn)?;
                }
                RollEntry::Load { old_iname, .. } => {
                    self.target.commit_load(old_iname, self.lsn)?;
                }
                RollEntry::RollInclude {
                    xid,
                    num_nodes,
                    spilled_head,
                    spilled_tail,
                } => {
                    self.walk_included_chain(*xid, *num_nodes, *spilled_head, *spilled_tail)?;
                }
                // Point writes, file creates, renames, descriptor changes
                // and hot indexes are final on commit.
                _ => {}
            }
        } else {
            match entry {
                RollEntry::Insert { filenum, key } => {
                    self.target.undo_insert(*filenum, key, xids, self.lsn)?;
                }
                RollEntry::Delete { filenum, key } => {
                    self.target.undo_delete(*filenum, key, xids, self.lsn)?;
                }
                RollEntry::Update { filenum, key } => {
                    self.target.undo_update(*filenum, key, xids, self.lsn)?;
                }
                RollEntry::UpdateBroadcast { filenum } => {
                    self.target.undo_update_broadcast(*filenum, xids, self.lsn)?;
                }
                RollEntry::FileCreate { filenum, iname } => {
                    self.target.abort_file_create(*filenum, iname, self.lsn)?;
                }
                RollEntry::FileRename {
                    filenum,
                    old_iname,
                    new_iname,
                } => {
                    self.target
                        .abort_file_rename(*filenum, old_iname, new_iname, self.lsn)?;
                }
                RollEntry::Load { new_iname, .. } => {
                    self.target.abort_load(new_iname, self.lsn)?;
                }
                RollEntry::ChangeDescriptor {
                    filenum,
                    old_descriptor,
                } => {
                    self.target
                        .abort_change_descriptor(*filenum, old_descriptor, self.lsn)?;
                }
                RollEntry::RollInclude {
                    xid,
                    num_nodes,
                    spilled_head,
                    spilled_tail,
                } => {
                    self.walk_included_chain(*xid, *num_nodes, *spilled_head, *spilled_tail)?;
                }
                // An unlink that never happened needs no undo.
                RollEntry::FileDelete { .. } | RollEntry::HotIndex { .. } => {}
            }
        }
        let processed = {
            let mut inner = self.txn.inner();
            inner.roll.num_rollentries_processed += 1;
            inner.roll.num_rollentries_processed
        };
        if processed % PROGRESS_POLL_PERIOD == 0 {
            self.poll_progress();
        }
        Ok(())
    }

    /// Apply a committed child's spilled chain (owned by this transaction
    /// through a `rollinclude` entry), tail to head.
    fn walk_included_chain(
        &self,
        xid: TxnidPair,
        num_nodes: u64,
        spilled_head: Blocknum,
        spilled_tail: Blocknum,
    ) -> Result<()> {
        let cachefile = self.logger.rollback_cachefile()?;
        let mut next_log = spilled_tail;
        let mut last_sequence = num_nodes;
        while !next_log.is_none() {
            let entries = take_verified_entries(&cachefile, next_log, xid, last_sequence - 1)?;
            let previous =
                cachefile.with_page(next_log, |log: &RollbackLog| log.previous)?;
            prefetch_previous(&cachefile, previous);
            last_sequence -= 1;
            for entry in entries.iter().rev() {
                self.apply_one(entry)?;
            }
            if next_log == spilled_head {
                if last_sequence != 0 {
                    return Err(FtxError::run_recovery(
                        "included rollback chain head out of sequence",
                    ));
                }
                unpin_and_remove(&cachefile, self.logger, next_log, false)?;
                break;
            }
            unpin_and_remove(&cachefile, self.logger, next_log, false)?;
            next_log = previous;
        }
        Ok(())
    }
}

/// Pin the node, verify ownership and sequence, and take its entries.
fn take_verified_entries(
    cachefile: &Arc<Cachefile>,
    blocknum: Blocknum,
    owner: TxnidPair,
    expected_sequence: u64,
) -> Result<Vec<RollEntry>> {
    cachefile.with_page_mut(blocknum, |log: &mut RollbackLog| {
        verify_contents(log, owner, expected_sequence)?;
        Ok(std::mem::take(&mut log.entries))
    })?
}

// ---------------------------------------------------------------------------
// Chain walk
// ---------------------------------------------------------------------------

/// Walk the transaction's own chain newest→oldest, applying `ctx` to each
/// entry and freeing nodes behind the walk. At most one node per
/// transaction is handed back to the one-slot cache.
fn apply_txn(ctx: &ApplyCtx<'_>) -> Result<()> {
    let (mut next_log, mut is_current, mut last_sequence, spilled_head) = {
        let inner = ctx.txn.inner();
        if inner.roll.has_current() {
            (
                inner.roll.current_rollback,
                true,
                inner.roll.num_rollback_nodes,
                inner.roll.spilled_rollback_head,
            )
        } else if inner.roll.has_spilled() {
            (
                inner.roll.spilled_rollback_tail,
                false,
                inner.roll.num_rollback_nodes,
                inner.roll.spilled_rollback_head,
            )
        } else {
            return Ok(());
        }
    };
    let cachefile = ctx.logger.rollback_cachefile()?;

    let mut found_head = false;
    while !next_log.is_none() {
        let entries =
            take_verified_entries(&cachefile, next_log, ctx.txn.txnid(), last_sequence - 1)?;
        let (sequence, previous) =
            cachefile.with_page(next_log, |log: &RollbackLog| (log.sequence, log.previous))?;
        prefetch_previous(&cachefile, previous);
        last_sequence = sequence;

        for entry in entries.iter().rev() {
            ctx.apply_one(entry)?;
        }

        if next_log == spilled_head {
            if found_head || sequence != 0 {
                return Err(FtxError::run_recovery(
                    "rollback chain head reached out of sequence",
                ));
            }
            found_head = true;
        }

        let drained = next_log;
        next_log = previous;
        {
            // Keep the transaction's pointers consistent behind the walk
            // so close never double-frees.
            let mut inner = ctx.txn.inner();
            if is_current {
                inner.roll.current_rollback = Blocknum::ROLLBACK_NONE;
                is_current = false;
            } else {
                inner.roll.spilled_rollback_tail = next_log;
            }
            if found_head {
                debug_assert!(next_log.is_none());
                inner.roll.spilled_rollback_head = Blocknum::ROLLBACK_NONE;
            }
        }

        // Each transaction offers at most one node back to the cache: the
        // last one of the walk.
        if next_log.is_none() {
            ctx.logger.rollback_node_cache().give(entries);
        }
        cachefile.remove_page(drained);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commit / abort entry points
// ---------------------------------------------------------------------------

/// Commit walk. A root applies commit handlers over its chain; a child
/// promotes everything to its parent: the spilled chain becomes a
/// `rollinclude` entry, the current node's entries are spliced onto the
/// parent's current node, and counters and flags transfer.
pub fn rollback_commit(
    txn: &Arc<Txn>,
    logger: &Logger,
    target: &dyn RollbackTarget,
    oplsn: Lsn,
    poll: Option<ProgressPoll<'_>>,
) -> Result<()> {
    let Some(parent) = txn.parent().cloned() else {
        let ctx = ApplyCtx {
            txn,
            logger,
            target,
            lsn: oplsn,
            is_commit: true,
            poll,
        };
        return apply_txn(&ctx);
    };

    // Child commit: promotion, not application.
    let (has_spilled, spilled_head, spilled_tail, include_nodes) = {
        let inner = txn.inner();
        let mut nodes = inner.roll.num_rollback_nodes;
        if inner.roll.has_current() {
            // The in-progress node is spliced, not included.
            nodes -= 1;
        }
        (
            inner.roll.has_spilled(),
            inner.roll.spilled_rollback_head,
            inner.roll.spilled_rollback_tail,
            nodes,
        )
    };

    if has_spilled {
        save_rollback(
            &parent,
            logger,
            RollEntry::RollInclude {
                xid: txn.txnid(),
                num_nodes: include_nodes,
                spilled_head,
                spilled_tail,
            },
        )?;
        let mut inner = txn.inner();
        inner.roll.spilled_rollback_head = Blocknum::ROLLBACK_NONE;
        inner.roll.spilled_rollback_tail = Blocknum::ROLLBACK_NONE;
        debug!(
            child = %txn.txnid(),
            parent = %parent.txnid(),
            nodes = include_nodes,
            "spilled rollback chain promoted via rollinclude"
        );
    }

    let (child_current, child_expected_seq) = {
        let inner = txn.inner();
        (
            inner.roll.current_rollback,
            inner.roll.num_rollback_nodes.saturating_sub(1),
        )
    };
    if !child_current.is_none() {
        let cachefile = logger.rollback_cachefile()?;
        let parent_bn = get_and_pin_rollback_log_for_new_entry(&parent, logger)?;

        let (entries, resident) = cachefile.with_page_mut(child_current, |log: &mut RollbackLog| {
            verify_contents(log, txn.txnid(), child_expected_seq)?;
            let entries = std::mem::take(&mut log.entries);
            let resident = log.resident_bytes;
            log.resident_bytes = 0;
            Ok::<(Vec<RollEntry>, u64), FtxError>((entries, resident))
        })??;

        // Child entries are newer than anything in the parent's node, so
        // they go on the newest end.
        cachefile.with_page_mut(parent_bn, |log: &mut RollbackLog| {
            log.entries.extend(entries);
            log.resident_bytes += resident;
        })?;
        let raw = txn.inner().roll.rollentry_raw_count;
        parent.inner().roll.rollentry_raw_count += raw;

        unpin_and_remove(&cachefile, logger, child_current, true)?;
        txn.inner().roll.current_rollback = Blocknum::ROLLBACK_NONE;

        maybe_spill(&parent, logger, parent_bn)?;
    }

    // The parent inherits the child's dictionary set, fsync intent,
    // entry count, and checkpoint requirement.
    let dictionaries = txn.inner().open_dictionaries.clone();
    for dict in &dictionaries {
        parent.maybe_note_dictionary(dict);
    }
    let (force_fsync, num_rollentries, checkpoint_needed) = {
        let inner = txn.inner();
        (
            inner.force_fsync_on_commit,
            inner.roll.num_rollentries,
            inner.checkpoint_needed_before_commit,
        )
    };
    let mut pi = parent.inner();
    pi.force_fsync_on_commit |= force_fsync;
    pi.roll.num_rollentries += num_rollentries;
    pi.checkpoint_needed_before_commit |= checkpoint_needed;
    Ok(())
}

/// Abort walk: apply abort handlers over the whole chain.
pub fn rollback_abort(
    txn: &Arc<Txn>,
    logger: &Logger,
    target: &dyn RollbackTarget,
    oplsn: Lsn,
    poll: Option<ProgressPoll<'_>>,
) -> Result<()> {
    let ctx = ApplyCtx {
        txn,
        logger,
        target,
        lsn: oplsn,
        is_commit: false,
        poll,
    };
    apply_txn(&ctx)
}
