//! Per-transaction undo log, stored as pages in the rollback cachefile.
//!
//! A transaction's undo state is a backward chain of rollback log nodes:
//! the in-progress `current` node, plus an already-spilled chain from
//! `spilled_tail` back to `spilled_head`. `sequence` numbers decrease from
//! tail to head and reach zero at the head. Nodes live in the same page
//! cache as everything else, so they are captured by checkpoints and
//! survive crashes for still-open transactions.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use ftx_cachetable::{CachePage, Cachefile, PageCodec};
use ftx_error::{FtxError, Result};
use ftx_types::{Blocknum, Filenum, TxnidPair};

use ftx_log::codec::{Rbuf, Wbuf};

use crate::logger::Logger;
use crate::txn::Txn;

/// Conventional name of the rollback cachefile.
pub const ROLLBACK_CACHEFILE_NAME: &str = "tokudb.rollback";

/// Default spill threshold: a node whose resident entries exceed this many
/// bytes is moved onto the spilled chain.
pub const DEFAULT_ROLLBACK_SPILL_THRESHOLD: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Roll entries
// ---------------------------------------------------------------------------

/// One undo record. Each variant has a commit handler (usually a no-op or a
/// file unlink) and an abort handler (the actual undo); see
/// `rollback_apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollEntry {
    Insert {
        filenum: Filenum,
        key: Vec<u8>,
    },
    Delete {
        filenum: Filenum,
        key: Vec<u8>,
    },
    Update {
        filenum: Filenum,
        key: Vec<u8>,
    },
    UpdateBroadcast {
        filenum: Filenum,
    },
    FileCreate {
        filenum: Filenum,
        iname: Vec<u8>,
    },
    FileDelete {
        filenum: Filenum,
        iname: Vec<u8>,
    },
    FileRename {
        filenum: Filenum,
        old_iname: Vec<u8>,
        new_iname: Vec<u8>,
    },
    HotIndex {
        filenums: Vec<Filenum>,
    },
    Load {
        old_iname: Vec<u8>,
        new_iname: Vec<u8>,
    },
    ChangeDescriptor {
        filenum: Filenum,
        old_descriptor: Vec<u8>,
    },
    /// A committed child's spilled sub-chain, owned by the parent from the
    /// moment this entry exists.
    RollInclude {
        xid: TxnidPair,
        num_nodes: u64,
        spilled_head: Blocknum,
        spilled_tail: Blocknum,
    },
}

impl RollEntry {
    fn tag(&self) -> u8 {
        match self {
            Self::Insert { .. } => 1,
            Self::Delete { .. } => 2,
            Self::Update { .. } => 3,
            Self::UpdateBroadcast { .. } => 4,
            Self::FileCreate { .. } => 5,
            Self::FileDelete { .. } => 6,
            Self::FileRename { .. } => 7,
            Self::HotIndex { .. } => 8,
            Self::Load { .. } => 9,
            Self::ChangeDescriptor { .. } => 10,
            Self::RollInclude { .. } => 11,
        }
    }

    /// Serialized size; used for spill accounting and raw-count stats.
    #[must_use]
    pub fn serialized_size(&self) -> u64 {
        let mut w = Wbuf::new();
        self.serialize(&mut w);
        w.len() as u64
    }

    pub fn serialize(&self, w: &mut Wbuf) {
        w.put_u8(self.tag());
        match self {
            Self::Insert { filenum, key }
            | Self::Delete { filenum, key }
            | Self::Update { filenum, key } => {
                w.put_filenum(*filenum);
                w.put_bytes(key);
            }
            Self::UpdateBroadcast { filenum } => {
                w.put_filenum(*filenum);
            }
            Self::FileCreate { filenum, iname } | Self::FileDelete { filenum, iname } => {
                w.put_filenum(*filenum);
                w.put_bytes(iname);
            }
            Self::FileRename {
                filenum,
                old_iname,
                new_iname,
            } => {
                w.put_filenum(*filenum);
                w.put_bytes(old_iname);
                w.put_bytes(new_iname);
            }
            Self::HotIndex { filenums } => {
                w.put_filenums(filenums);
            }
            Self::Load {
                old_iname,
                new_iname,
            } => {
                w.put_bytes(old_iname);
                w.put_bytes(new_iname);
            }
            Self::ChangeDescriptor {
                filenum,
                old_descriptor,
            } => {
                w.put_filenum(*filenum);
                w.put_bytes(old_descriptor);
            }
            Self::RollInclude {
                xid,
                num_nodes,
                spilled_head,
                spilled_tail,
            } => {
                w.put_txnid_pair(*xid);
                w.put_u64(*num_nodes);
                w.put_blocknum(*spilled_head);
                w.put_blocknum(*spilled_tail);
            }
        }
    }

    pub fn deserialize(r: &mut Rbuf<'_>) -> Result<Self> {
        let tag = r.get_u8()?;
        let entry = match tag {
            1 => Self::Insert {
                filenum: r.get_filenum()?,
                key: r.get_bytes()?,
            },
            2 => Self::Delete {
                filenum: r.get_filenum()?,
                key: r.get_bytes()?,
            },
            3 => Self::Update {
                filenum: r.get_filenum()?,
                key: r.get_bytes()?,
            },
            4 => Self::UpdateBroadcast {
                filenum: r.get_filenum()?,
            },
            5 => Self::FileCreate {
                filenum: r.get_filenum()?,
                iname: r.get_bytes()?,
            },
            6 => Self::FileDelete {
                filenum: r.get_filenum()?,
                iname: r.get_bytes()?,
            },
            7 => Self::FileRename {
                filenum: r.get_filenum()?,
                old_iname: r.get_bytes()?,
                new_iname: r.get_bytes()?,
            },
            8 => Self::HotIndex {
                filenums: r.get_filenums()?,
            },
            9 => Self::Load {
                old_iname: r.get_bytes()?,
                new_iname: r.get_bytes()?,
            },
            10 => Self::ChangeDescriptor {
                filenum: r.get_filenum()?,
                old_descriptor: r.get_bytes()?,
            },
            11 => Self::RollInclude {
                xid: r.get_txnid_pair()?,
                num_nodes: r.get_u64()?,
                spilled_head: r.get_blocknum()?,
                spilled_tail: r.get_blocknum()?,
            },
            other => {
                return Err(FtxError::run_recovery(format!(
                    "unknown roll entry tag {other}"
                )));
            }
        };
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// Rollback log node
// ---------------------------------------------------------------------------

/// One page of a transaction's undo chain.
#[derive(Debug)]
pub struct RollbackLog {
    pub txnid: TxnidPair,
    /// Position in the chain; zero at the head, increasing toward the tail.
    pub sequence: u64,
    /// Blocknum of the next-older node, `ROLLBACK_NONE` at the head.
    pub previous: Blocknum,
    /// Entries in oldest→newest order; apply walks them in reverse.
    pub entries: Vec<RollEntry>,
    /// Serialized size of resident entries, for the spill threshold.
    pub resident_bytes: u64,
}

impl RollbackLog {
    #[must_use]
    pub fn new(txnid: TxnidPair, sequence: u64, previous: Blocknum, entries: Vec<RollEntry>) -> Self {
        Self {
            txnid,
            sequence,
            previous,
            entries,
            resident_bytes: 0,
        }
    }
}

impl CachePage for RollbackLog {
    fn page_bytes(&self) -> Vec<u8> {
        let mut w = Wbuf::new();
        w.put_txnid_pair(self.txnid);
        w.put_u64(self.sequence);
        w.put_blocknum(self.previous);
        w.put_u64(self.resident_bytes);
        w.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.serialize(&mut w);
        }
        w.into_inner()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Codec for the rollback cachefile.
pub struct RollbackPageCodec;

impl PageCodec for RollbackPageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn CachePage>> {
        let mut r = Rbuf::new(bytes);
        let txnid = r.get_txnid_pair()?;
        let sequence = r.get_u64()?;
        let previous = r.get_blocknum()?;
        let resident_bytes = r.get_u64()?;
        let count = r.get_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(RollEntry::deserialize(&mut r)?);
        }
        r.expect_consumed("rollback page")?;
        Ok(Box::new(RollbackLog {
            txnid,
            sequence,
            previous,
            entries,
            resident_bytes,
        }))
    }
}

// ---------------------------------------------------------------------------
// One-slot node cache
// ---------------------------------------------------------------------------

/// Per-logger cache of at most one reusable rollback node allocation,
/// amortizing churn for short transactions. When the slot is occupied a
/// second candidate is simply destroyed; which transaction's node wins is
/// unspecified.
#[derive(Default)]
pub struct RollbackNodeCache {
    slot: parking_lot::Mutex<Option<Vec<RollEntry>>>,
}

impl RollbackNodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an emptied entries allocation. Returns whether it was kept.
    pub fn give(&self, mut entries: Vec<RollEntry>) -> bool {
        entries.clear();
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(entries);
            true
        } else {
            false
        }
    }

    /// Take the cached allocation if present.
    pub fn take(&self) -> Option<Vec<RollEntry>> {
        self.slot.lock().take()
    }
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Assert a pinned node belongs to `txnid` at chain position
/// `expected_sequence`. Called on every pin during apply.
pub fn verify_contents(
    log: &RollbackLog,
    txnid: TxnidPair,
    expected_sequence: u64,
) -> Result<()> {
    if log.txnid != txnid {
        return Err(FtxError::run_recovery(format!(
            "rollback node owned by {} but walked for {}",
            log.txnid, txnid
        )));
    }
    if log.sequence != expected_sequence {
        return Err(FtxError::run_recovery(format!(
            "rollback chain sequence {} where {} expected",
            log.sequence, expected_sequence
        )));
    }
    Ok(())
}

/// Ensure `txn` has a current rollback node, allocating (or reusing the
/// cached allocation) and chaining behind the spilled tail if needed.
/// Returns its blocknum.
pub fn get_and_pin_rollback_log_for_new_entry(
    txn: &Txn,
    logger: &Logger,
) -> Result<Blocknum> {
    let cachefile = logger.rollback_cachefile()?;
    let mut inner = txn.inner();
    if !inner.roll.current_rollback.is_none() {
        return Ok(inner.roll.current_rollback);
    }
    let blocknum = cachefile.allocate_blocknum();
    let entries = logger.rollback_node_cache().take().unwrap_or_default();
    let node = RollbackLog::new(
        txn.txnid(),
        inner.roll.num_rollback_nodes,
        inner.roll.spilled_rollback_tail,
        entries,
    );
    cachefile.put_new_page(blocknum, Box::new(node))?;
    inner.roll.num_rollback_nodes += 1;
    inner.roll.current_rollback = blocknum;
    debug!(
        txnid = %txn.txnid(),
        blocknum = blocknum.get(),
        sequence = inner.roll.num_rollback_nodes - 1,
        "rollback node allocated"
    );
    Ok(blocknum)
}

/// Append one undo entry into the transaction's current rollback node,
/// spilling the node onto the spilled chain if it crosses the threshold.
pub fn save_rollback(txn: &Txn, logger: &Logger, entry: RollEntry) -> Result<()> {
    let blocknum = get_and_pin_rollback_log_for_new_entry(txn, logger)?;
    let cachefile = logger.rollback_cachefile()?;
    let size = entry.serialized_size();
    cachefile.with_page_mut(blocknum, |log: &mut RollbackLog| {
        log.entries.push(entry);
        log.resident_bytes += size;
    })?;
    let mut inner = txn.inner();
    inner.roll.num_rollentries += 1;
    inner.roll.rollentry_raw_count += size;
    drop(inner);
    maybe_spill(txn, logger, blocknum)
}

/// Move the current node onto the spilled chain if its resident bytes
/// exceed the spill threshold.
pub fn maybe_spill(txn: &Txn, logger: &Logger, blocknum: Blocknum) -> Result<()> {
    let cachefile = logger.rollback_cachefile()?;
    let resident =
        cachefile.with_page(blocknum, |log: &RollbackLog| log.resident_bytes)?;
    if resident <= logger.rollback_spill_threshold() {
        return Ok(());
    }
    let mut inner = txn.inner();
    if inner.roll.current_rollback != blocknum {
        return Ok(());
    }
    if inner.roll.spilled_rollback_head.is_none() {
        inner.roll.spilled_rollback_head = blocknum;
    }
    inner.roll.spilled_rollback_tail = blocknum;
    inner.roll.current_rollback = Blocknum::ROLLBACK_NONE;
    debug!(
        txnid = %txn.txnid(),
        blocknum = blocknum.get(),
        resident,
        "rollback node spilled"
    );
    Ok(())
}

/// Unpin a drained node and free it, or hand its allocation to the
/// one-slot cache (at most once per transaction; the caller tracks that by
/// only offering the final node of the walk).
pub fn unpin_and_remove(
    cachefile: &Arc<Cachefile>,
    logger: &Logger,
    blocknum: Blocknum,
    offer_to_cache: bool,
) -> Result<bool> {
    let mut gave_back = false;
    if offer_to_cache {
        let entries = cachefile
            .with_page_mut(blocknum, |log: &mut RollbackLog| {
                std::mem::take(&mut log.entries)
            })?;
        gave_back = logger.rollback_node_cache().give(entries);
    }
    cachefile.remove_page(blocknum);
    Ok(gave_back)
}

/// Hint that the walk will pin `previous` next.
pub fn prefetch_previous(cachefile: &Arc<Cachefile>, previous: Blocknum) {
    if !previous.is_none() {
        cachefile.prefetch(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftx_types::Txnid;

    #[test]
    fn test_roll_entry_roundtrip() {
        let entries = vec![
            RollEntry::Insert {
                filenum: Filenum(3),
                key: b"k1".to_vec(),
            },
            RollEntry::Delete {
                filenum: Filenum(3),
                key: b"k2".to_vec(),
            },
            RollEntry::FileCreate {
                filenum: Filenum(4),
                iname: b"t.data".to_vec(),
            },
            RollEntry::RollInclude {
                xid: TxnidPair::child(Txnid(9), Txnid(12)),
                num_nodes: 3,
                spilled_head: Blocknum(1),
                spilled_tail: Blocknum(5),
            },
        ];
        for entry in entries {
            let mut w = Wbuf::new();
            entry.serialize(&mut w);
            let bytes = w.into_inner();
            let mut r = Rbuf::new(&bytes);
            let back = RollEntry::deserialize(&mut r).unwrap();
            assert_eq!(back, entry);
            r.expect_consumed("entry").unwrap();
        }
    }

    #[test]
    fn test_rollback_page_roundtrip() {
        let log = RollbackLog {
            txnid: TxnidPair::root(Txnid(7)),
            sequence: 2,
            previous: Blocknum(11),
            entries: vec![RollEntry::Insert {
                filenum: Filenum(1),
                key: b"abc".to_vec(),
            }],
            resident_bytes: 13,
        };
        let bytes = log.page_bytes();
        let page = RollbackPageCodec.decode(&bytes).unwrap();
        let back = page.as_any().downcast_ref::<RollbackLog>().unwrap();
        assert_eq!(back.txnid, log.txnid);
        assert_eq!(back.sequence, 2);
        assert_eq!(back.previous, Blocknum(11));
        assert_eq!(back.entries, log.entries);
        assert_eq!(back.resident_bytes, 13);
    }

    #[test]
    fn test_verify_contents_rejects_wrong_owner_and_sequence() {
        let log = RollbackLog::new(TxnidPair::root(Txnid(5)), 1, Blocknum::ROLLBACK_NONE, vec![]);
        verify_contents(&log, TxnidPair::root(Txnid(5)), 1).unwrap();
        assert!(
            verify_contents(&log, TxnidPair::root(Txnid(6)), 1)
                .unwrap_err()
                .is_corruption()
        );
        assert!(
            verify_contents(&log, TxnidPair::root(Txnid(5)), 0)
                .unwrap_err()
                .is_corruption()
        );
    }

    #[test]
    fn test_one_slot_cache_keeps_first() {
        let cache = RollbackNodeCache::new();
        assert!(cache.give(vec![RollEntry::UpdateBroadcast {
            filenum: Filenum(1)
        }]));
        // Second offer loses.
        assert!(!cache.give(Vec::new()));
        let taken = cache.take().unwrap();
        assert!(taken.is_empty(), "cached allocation is handed back cleared");
        // Slot is free again.
        assert!(cache.give(Vec::new()));
    }
}
