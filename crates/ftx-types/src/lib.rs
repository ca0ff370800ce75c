//! Core identifier types shared by every crate in the engine.
//!
//! All of these are thin newtypes over integers with explicit sentinels.
//! Nothing in here does I/O; the wire encodings live next to the code that
//! writes them (`ftx-log` for log records, `ftx-txn` for rollback pages).

use serde::Serialize;

// ---------------------------------------------------------------------------
// LSN
// ---------------------------------------------------------------------------

/// Log sequence number. Monotone, totally ordered, assigned by the log
/// writer under its input lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Sentinel meaning "no LSN".
    pub const ZERO: Self = Self(0);
    /// Upper bound, used as "accept anything" for cachefile opens.
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TXNID
// ---------------------------------------------------------------------------

/// A single 64-bit transaction id. Root ids are assigned monotonically by
/// the transaction manager; `TXNID_NONE` (zero) is the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Txnid(pub u64);

impl Txnid {
    /// Sentinel meaning "no transaction".
    pub const NONE: Self = Self(0);
    /// Upper bound, used when computing minima over live ids.
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl std::fmt::Display for Txnid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one transaction: the root id plus, for children, the child's
/// own id. A root carries `child_id64 == Txnid::NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TxnidPair {
    pub parent_id64: Txnid,
    pub child_id64: Txnid,
}

impl TxnidPair {
    pub const NONE: Self = Self {
        parent_id64: Txnid::NONE,
        child_id64: Txnid::NONE,
    };

    #[must_use]
    pub const fn root(id: Txnid) -> Self {
        Self {
            parent_id64: id,
            child_id64: Txnid::NONE,
        }
    }

    #[must_use]
    pub const fn child(root: Txnid, child: Txnid) -> Self {
        Self {
            parent_id64: root,
            child_id64: child,
        }
    }

    #[must_use]
    pub const fn is_root(self) -> bool {
        self.child_id64.is_none()
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.parent_id64.is_none() && self.child_id64.is_none()
    }

    /// The id this transaction is known by: the child id for children, the
    /// root id otherwise.
    #[must_use]
    pub const fn own_id(self) -> Txnid {
        if self.child_id64.is_none() {
            self.parent_id64
        } else {
            self.child_id64
        }
    }
}

impl std::fmt::Display for TxnidPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "{}", self.parent_id64)
        } else {
            write!(f, "{}/{}", self.parent_id64, self.child_id64)
        }
    }
}

// ---------------------------------------------------------------------------
// BLOCKNUM / FILENUM
// ---------------------------------------------------------------------------

/// Logical page address within a cachefile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Blocknum(pub i64);

impl Blocknum {
    /// Sentinel: "no rollback node here".
    pub const ROLLBACK_NONE: Self = Self(-1);

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::ROLLBACK_NONE.0
    }
}

/// Identifier of one open cachefile (one dictionary, or the rollback file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Filenum(pub u32);

impl Filenum {
    pub const NONE: Self = Self(u32::MAX);

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// XIDS stack
// ---------------------------------------------------------------------------

/// Ordered root→leaf stack of transaction ids. The root-level stack is
/// empty; every message written to an index and every undo entry is tagged
/// with the writing transaction's stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Xids {
    ids: Vec<Txnid>,
}

impl Xids {
    /// The empty stack, representing "no transaction" (the root of roots).
    #[must_use]
    pub fn root() -> Self {
        Self { ids: Vec::new() }
    }

    #[must_use]
    pub fn from_ids(ids: Vec<Txnid>) -> Self {
        Self { ids }
    }

    /// Stack for a child of `self` with id `child`.
    #[must_use]
    pub fn push_child(&self, child: Txnid) -> Self {
        let mut ids = self.ids.clone();
        ids.push(child);
        Self { ids }
    }

    /// Depth of nesting; zero for the root stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Outermost (root transaction) id, or `Txnid::NONE` for the root stack.
    #[must_use]
    pub fn outermost(&self) -> Txnid {
        self.ids.first().copied().unwrap_or(Txnid::NONE)
    }

    /// Innermost (leaf transaction) id, or `Txnid::NONE` for the root stack.
    #[must_use]
    pub fn innermost(&self) -> Txnid {
        self.ids.last().copied().unwrap_or(Txnid::NONE)
    }

    #[must_use]
    pub fn ids(&self) -> &[Txnid] {
        &self.ids
    }

    /// Whether `self` is `other` or an ancestor of `other`, i.e. `self` is a
    /// prefix of `other`. Used to decide whether an undo removes a
    /// descendant's version.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.ids.len() >= self.ids.len() && other.ids[..self.ids.len()] == self.ids[..]
    }
}

// ---------------------------------------------------------------------------
// XA xid
// ---------------------------------------------------------------------------

/// Maximum combined gtrid+bqual payload of an XA identifier.
pub const XA_XID_DATA_MAX: usize = 128;

/// Externally supplied two-phase-commit identifier, recorded when a root
/// transaction prepares. `format_id == -1` means "invalid data" per the XA
/// specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XaXid {
    pub format_id: i32,
    pub gtrid_length: u32,
    pub bqual_length: u32,
    pub data: [u8; XA_XID_DATA_MAX],
}

impl XaXid {
    /// The invalid sentinel value.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            format_id: -1,
            gtrid_length: 0,
            bqual_length: 0,
            data: [0; XA_XID_DATA_MAX],
        }
    }

    /// Build an xid from gtrid and bqual byte strings.
    ///
    /// Truncates silently if the combined payload exceeds the XA envelope;
    /// callers are expected to stay within it.
    #[must_use]
    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> Self {
        let mut data = [0_u8; XA_XID_DATA_MAX];
        let glen = gtrid.len().min(XA_XID_DATA_MAX);
        let blen = bqual.len().min(XA_XID_DATA_MAX - glen);
        data[..glen].copy_from_slice(&gtrid[..glen]);
        data[glen..glen + blen].copy_from_slice(&bqual[..blen]);
        Self {
            format_id,
            gtrid_length: glen as u32,
            bqual_length: blen as u32,
            data,
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.format_id != -1
    }

    /// The populated prefix of the data payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.gtrid_length + self.bqual_length) as usize]
    }
}

impl Default for XaXid {
    fn default() -> Self {
        Self::invalid()
    }
}

// ---------------------------------------------------------------------------
// Snapshot type / transaction state
// ---------------------------------------------------------------------------

/// How a transaction participates in MVCC visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnapshotType {
    /// No snapshot; reads see the latest committed state.
    None,
    /// Snapshot taken by the root (children inherit it).
    Root,
    /// Child explicitly takes its own snapshot.
    Child,
}

/// Lifecycle state of one transaction. Transitions are driven exclusively
/// by the transaction manager under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnState {
    Live,
    Preparing,
    Committing,
    Aborting,
    Retired,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering_and_sentinels() {
        assert!(Lsn::ZERO < Lsn(1));
        assert!(Lsn(1) < Lsn::MAX);
        assert_eq!(Lsn(7).next(), Lsn(8));
        assert!(Lsn::ZERO.is_zero());
        assert!(!Lsn(1).is_zero());
    }

    #[test]
    fn test_txnid_pair_root_vs_child() {
        let root = TxnidPair::root(Txnid(10));
        assert!(root.is_root());
        assert_eq!(root.own_id(), Txnid(10));

        let child = TxnidPair::child(Txnid(10), Txnid(11));
        assert!(!child.is_root());
        assert_eq!(child.own_id(), Txnid(11));
        assert_eq!(child.parent_id64, Txnid(10));
    }

    #[test]
    fn test_xids_push_and_prefix() {
        let root = Xids::root();
        assert_eq!(root.depth(), 0);
        assert_eq!(root.outermost(), Txnid::NONE);

        let t1 = root.push_child(Txnid(5));
        let t1c = t1.push_child(Txnid(6));
        assert_eq!(t1c.depth(), 2);
        assert_eq!(t1c.outermost(), Txnid(5));
        assert_eq!(t1c.innermost(), Txnid(6));

        assert!(t1.is_prefix_of(&t1c));
        assert!(t1.is_prefix_of(&t1));
        assert!(!t1c.is_prefix_of(&t1));

        let other = root.push_child(Txnid(9));
        assert!(!t1.is_prefix_of(&other));
    }

    #[test]
    fn test_xa_xid_roundtrip() {
        let xid = XaXid::new(42, b"global-txn-1", b"branch-7");
        assert!(xid.is_valid());
        assert_eq!(xid.gtrid_length, 12);
        assert_eq!(xid.bqual_length, 8);
        assert_eq!(xid.payload(), b"global-txn-1branch-7");

        let invalid = XaXid::invalid();
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_blocknum_sentinel() {
        assert!(Blocknum::ROLLBACK_NONE.is_none());
        assert!(!Blocknum(0).is_none());
    }
}
