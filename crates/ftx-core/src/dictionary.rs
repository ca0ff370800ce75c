//! A minimal multi-version dictionary.
//!
//! One sorted map per dictionary, held on a single page in the
//! dictionary's cachefile. Every write adds a version tagged with the
//! writer's XIDS stack; reads resolve the newest version visible to the
//! caller; undo removes the writer's versions by stack prefix. The page
//! carries a max-applied LSN so replaying a log prefix twice equals
//! replaying it once.
//!
//! This is deliberately not a fractal tree: message buffers, node
//! serialization, and range machinery stay out of scope. It exists so the
//! transaction core above it is exercised end to end.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ftx_cachetable::{CachePage, Cachefile, PageCodec};
use ftx_error::Result;
use ftx_log::codec::{Rbuf, Wbuf};
use ftx_txn::OpenDictionary;
use ftx_types::{Blocknum, Filenum, Lsn, Txnid, TxnidPair, Xids};

/// The single page every dictionary lives on.
const ROOT_BLOCKNUM: Blocknum = Blocknum(0);

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// One version of one key. `value == None` is a delete tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub xids: Xids,
    pub value: Option<Vec<u8>>,
    pub lsn: Lsn,
}

// ---------------------------------------------------------------------------
// The page
// ---------------------------------------------------------------------------

/// In-memory dictionary state; serialized wholesale as the page image.
#[derive(Debug, Default)]
pub struct DictionaryPage {
    /// Highest LSN whose effect is present. Replay skips records at or
    /// below this.
    pub max_applied_lsn: Lsn,
    /// Embedder-supplied descriptor blob.
    pub descriptor: Vec<u8>,
    /// Key → versions, oldest to newest.
    pub rows: BTreeMap<Vec<u8>, Vec<Version>>,
}

impl CachePage for DictionaryPage {
    fn page_bytes(&self) -> Vec<u8> {
        let mut w = Wbuf::new();
        w.put_lsn(self.max_applied_lsn);
        w.put_bytes(&self.descriptor);
        w.put_u32(self.rows.len() as u32);
        for (key, versions) in &self.rows {
            w.put_bytes(key);
            w.put_u32(versions.len() as u32);
            for v in versions {
                w.put_xids(&v.xids);
                w.put_bool(v.value.is_some());
                if let Some(value) = &v.value {
                    w.put_bytes(value);
                }
                w.put_lsn(v.lsn);
            }
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

/// Codec reviving [`DictionaryPage`]s from their image.
pub struct DictionaryPageCodec;

impl PageCodec for DictionaryPageCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn CachePage>> {
        let mut r = Rbuf::new(bytes);
        let max_applied_lsn = r.get_lsn()?;
        let descriptor = r.get_bytes()?;
        let row_count = r.get_u32()? as usize;
        let mut rows = BTreeMap::new();
        for _ in 0..row_count {
            let key = r.get_bytes()?;
            let version_count = r.get_u32()? as usize;
            let mut versions = Vec::with_capacity(version_count);
            for _ in 0..version_count {
                let xids = r.get_xids()?;
                let value = if r.get_bool()? {
                    Some(r.get_bytes()?)
                } else {
                    None
                };
                let lsn = r.get_lsn()?;
                versions.push(Version { xids, value, lsn });
            }
            rows.insert(key, versions);
        }
        r.expect_consumed("dictionary page")?;
        Ok(Box::new(DictionaryPage {
            max_applied_lsn,
            descriptor,
            rows,
        }))
    }
}

// ---------------------------------------------------------------------------
// Dictionary
// ---------------------------------------------------------------------------

/// One open dictionary bound to a cachefile.
pub struct Dictionary {
    cachefile: Arc<Cachefile>,
    /// Root transaction that created (or locked-when-empty) this
    /// dictionary; cleared when that transaction closes.
    created_by: Mutex<Txnid>,
    /// Root transaction whose writes skip undo logging here.
    suppress_rollback_txnid: Mutex<Txnid>,
}

impl Dictionary {
    /// Wrap an opened cachefile, materializing the root page if absent.
    pub fn attach(cachefile: Arc<Cachefile>) -> Result<Arc<Self>> {
        if !cachefile.contains(ROOT_BLOCKNUM) {
            cachefile.put_new_page(ROOT_BLOCKNUM, Box::new(DictionaryPage::default()))?;
        }
        Ok(Arc::new(Self {
            cachefile,
            created_by: Mutex::new(Txnid::NONE),
            suppress_rollback_txnid: Mutex::new(Txnid::NONE),
        }))
    }

    #[must_use]
    pub fn cachefile(&self) -> &Arc<Cachefile> {
        &self.cachefile
    }

    #[must_use]
    pub fn iname(&self) -> &str {
        self.cachefile.iname()
    }

    pub fn set_created_by(&self, txnid: Txnid) {
        *self.created_by.lock() = txnid;
    }

    pub fn set_suppress_rollback(&self, txnid: Txnid) {
        *self.suppress_rollback_txnid.lock() = txnid;
    }

    /// Whether `root` writes here without undo logging.
    #[must_use]
    pub fn rollback_suppressed_for(&self, root: Txnid) -> bool {
        *self.suppress_rollback_txnid.lock() == root
    }

    fn with_page<R>(&self, f: impl FnOnce(&DictionaryPage) -> R) -> Result<R> {
        self.cachefile.with_page(ROOT_BLOCKNUM, f)
    }

    fn with_page_mut<R>(&self, f: impl FnOnce(&mut DictionaryPage) -> R) -> Result<R> {
        self.cachefile.with_page_mut(ROOT_BLOCKNUM, f)
    }

    /// Gate helper: true if `lsn` is new to this dictionary (and records
    /// it). A zero LSN is always applied (direct undo paths).
    fn gate(page: &mut DictionaryPage, lsn: Lsn) -> bool {
        if !lsn.is_zero() && lsn <= page.max_applied_lsn {
            return false;
        }
        if lsn > page.max_applied_lsn {
            page.max_applied_lsn = lsn;
        }
        true
    }

    // -----------------------------------------------------------------------
    // Write application (redo side)
    // -----------------------------------------------------------------------

    /// Add a version for `key`. Skipped when `lsn` was already applied.
    pub fn apply_insert(&self, xids: &Xids, key: &[u8], value: &[u8], lsn: Lsn) -> Result<()> {
        self.with_page_mut(|page| {
            if !Self::gate(page, lsn) {
                return;
            }
            page.rows.entry(key.to_vec()).or_default().push(Version {
                xids: xids.clone(),
                value: Some(value.to_vec()),
                lsn,
            });
        })
    }

    /// Add a delete tombstone for `key`.
    pub fn apply_delete(&self, xids: &Xids, key: &[u8], lsn: Lsn) -> Result<()> {
        self.with_page_mut(|page| {
            if !Self::gate(page, lsn) {
                return;
            }
            page.rows.entry(key.to_vec()).or_default().push(Version {
                xids: xids.clone(),
                value: None,
                lsn,
            });
        })
    }

    /// Broadcast a new value (or, when `is_resetting`, a tombstone) over
    /// every existing key.
    pub fn apply_update_broadcast(
        &self,
        xids: &Xids,
        extra: &[u8],
        is_resetting: bool,
        lsn: Lsn,
    ) -> Result<()> {
        self.with_page_mut(|page| {
            if !Self::gate(page, lsn) {
                return;
            }
            let keys: Vec<Vec<u8>> = page.rows.keys().cloned().collect();
            for key in keys {
                page.rows.entry(key).or_default().push(Version {
                    xids: xids.clone(),
                    value: if is_resetting {
                        None
                    } else {
                        Some(extra.to_vec())
                    },
                    lsn,
                });
            }
        })
    }

    // -----------------------------------------------------------------------
    // Undo application (abort side)
    // -----------------------------------------------------------------------

    /// Remove every version of `key` written by `prefix` or a descendant.
    pub fn undo_versions(&self, prefix: &Xids, key: &[u8]) -> Result<()> {
        self.with_page_mut(|page| {
            if let Some(versions) = page.rows.get_mut(key) {
                versions.retain(|v| !prefix.is_prefix_of(&v.xids));
                if versions.is_empty() {
                    page.rows.remove(key);
                }
            }
        })
    }

    /// Remove every version anywhere written by `prefix` or a descendant.
    pub fn undo_versions_broadcast(&self, prefix: &Xids) -> Result<()> {
        self.with_page_mut(|page| {
            page.rows
                .retain(|_, versions| {
                    versions.retain(|v| !prefix.is_prefix_of(&v.xids));
                    !versions.is_empty()
                });
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Resolve the newest version of `key` visible under `visible`.
    /// Returns `Ok(None)` for missing keys and visible tombstones alike.
    pub fn get(
        &self,
        key: &[u8],
        visible: impl Fn(&Xids) -> bool,
    ) -> Result<Option<Vec<u8>>> {
        self.with_page(|page| {
            let versions = page.rows.get(key)?;
            versions
                .iter()
                .rev()
                .find(|v| visible(&v.xids))
                .map(|v| v.value.clone())?
        })
    }

    /// Visible keys in order (scan support for tests and verification).
    pub fn keys(&self, visible: impl Fn(&Xids) -> bool) -> Result<Vec<Vec<u8>>> {
        self.with_page(|page| {
            page.rows
                .iter()
                .filter(|(_, versions)| {
                    versions
                        .iter()
                        .rev()
                        .find(|v| visible(&v.xids))
                        .is_some_and(|v| v.value.is_some())
                })
                .map(|(k, _)| k.clone())
                .collect()
        })
    }

    // -----------------------------------------------------------------------
    // Descriptor
    // -----------------------------------------------------------------------

    pub fn descriptor(&self) -> Result<Vec<u8>> {
        self.with_page(|page| page.descriptor.clone())
    }

    pub fn set_descriptor(&self, descriptor: &[u8], lsn: Lsn) -> Result<()> {
        self.with_page_mut(|page| {
            if !Self::gate(page, lsn) {
                return;
            }
            page.descriptor = descriptor.to_vec();
        })
    }

    /// Restore a descriptor during abort (no gating; undo runs once).
    pub fn restore_descriptor(&self, descriptor: &[u8]) -> Result<()> {
        self.with_page_mut(|page| page.descriptor = descriptor.to_vec())
    }

    /// Drop versions of completed transactions older than every possible
    /// reader, collapsing each key to its newest surviving committed
    /// value.
    pub fn simple_gc(&self, oldest_referenced_xid: Txnid) -> Result<()> {
        self.with_page_mut(|page| {
            page.rows.retain(|_, versions| {
                if versions.len() > 1 {
                    let keep_from = versions
                        .iter()
                        .rposition(|v| v.xids.outermost() < oldest_referenced_xid)
                        .unwrap_or(0);
                    versions.drain(..keep_from);
                }
                versions
                    .last()
                    .is_none_or(|v| v.value.is_some() || versions.len() > 1)
            });
        })
    }
}

impl OpenDictionary for Dictionary {
    fn filenum(&self) -> Filenum {
        self.cachefile.filenum()
    }

    fn note_txn_closing(&self, txnid: TxnidPair) {
        let mut created = self.created_by.lock();
        if *created == txnid.parent_id64 {
            *created = Txnid::NONE;
        }
        drop(created);
        let mut suppressed = self.suppress_rollback_txnid.lock();
        if *suppressed == txnid.parent_id64 {
            *suppressed = Txnid::NONE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn everything(_: &Xids) -> bool {
        true
    }

    fn dict() -> (tempfile::TempDir, Arc<Dictionary>) {
        let tmp = tempfile::tempdir().unwrap();
        let cf = Arc::new(
            Cachefile::open(
                Filenum(1),
                "d.data",
                &tmp.path().join("d.data"),
                Arc::new(DictionaryPageCodec),
                Lsn::MAX,
            )
            .unwrap(),
        );
        let d = Dictionary::attach(cf).unwrap();
        (tmp, d)
    }

    fn xids_for(id: u64) -> Xids {
        Xids::root().push_child(Txnid(id))
    }

    #[test]
    fn test_insert_then_get() {
        let (_tmp, d) = dict();
        d.apply_insert(&xids_for(1), b"k", b"v", Lsn(10)).unwrap();
        assert_eq!(d.get(b"k", everything).unwrap(), Some(b"v".to_vec()));
        assert_eq!(d.get(b"missing", everything).unwrap(), None);
    }

    #[test]
    fn test_tombstone_hides_older_version() {
        let (_tmp, d) = dict();
        d.apply_insert(&xids_for(1), b"k", b"v", Lsn(10)).unwrap();
        d.apply_delete(&xids_for(2), b"k", Lsn(11)).unwrap();
        assert_eq!(d.get(b"k", everything).unwrap(), None);
        // A reader that cannot see txn 2 still sees the old value.
        let only_one = |x: &Xids| x.outermost() == Txnid(1);
        assert_eq!(d.get(b"k", only_one).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_lsn_gate_makes_replay_idempotent() {
        let (_tmp, d) = dict();
        d.apply_insert(&xids_for(1), b"k", b"v1", Lsn(10)).unwrap();
        // Replaying the same record must not add a second version.
        d.apply_insert(&xids_for(1), b"k", b"v1", Lsn(10)).unwrap();
        let count = d
            .with_page(|page| page.rows.get(b"k".as_slice()).map_or(0, Vec::len))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_undo_removes_descendant_versions() {
        let (_tmp, d) = dict();
        let root = Xids::root().push_child(Txnid(5));
        let child = root.push_child(Txnid(6));
        d.apply_insert(&child, b"k", b"cv", Lsn(10)).unwrap();
        d.apply_insert(&xids_for(9), b"k", b"other", Lsn(11)).unwrap();

        // Undoing by the root's prefix removes the child's version only.
        d.undo_versions(&root, b"k").unwrap();
        let visible = d.get(b"k", everything).unwrap();
        assert_eq!(visible, Some(b"other".to_vec()));
    }

    #[test]
    fn test_page_roundtrip_preserves_rows() {
        let (_tmp, d) = dict();
        d.apply_insert(&xids_for(1), b"a", b"1", Lsn(5)).unwrap();
        d.apply_delete(&xids_for(2), b"b", Lsn(6)).unwrap();
        d.set_descriptor(b"desc", Lsn(7)).unwrap();

        let bytes = d
            .with_page(DictionaryPage::page_bytes)
            .unwrap();
        let page = DictionaryPageCodec.decode(&bytes).unwrap();
        let back = page.as_any().downcast_ref::<DictionaryPage>().unwrap();
        assert_eq!(back.max_applied_lsn, Lsn(7));
        assert_eq!(back.descriptor, b"desc");
        assert_eq!(back.rows.len(), 2);
    }

    #[test]
    fn test_keys_lists_only_visible_live_rows() {
        let (_tmp, d) = dict();
        d.apply_insert(&xids_for(1), b"a", b"1", Lsn(5)).unwrap();
        d.apply_insert(&xids_for(1), b"b", b"2", Lsn(6)).unwrap();
        d.apply_delete(&xids_for(1), b"b", Lsn(7)).unwrap();
        assert_eq!(d.keys(everything).unwrap(), vec![b"a".to_vec()]);
    }
}
