//! The page-cache layer as consumed by the transaction core.
//!
//! This is deliberately not a full buffer pool: there is no eviction and no
//! partial fetch. What it does provide — and what the transaction core
//! depends on — is the cachefile lifecycle (open/close under a dedicated
//! lock), page pinning, dirty tracking, and the checkpoint protocol
//! (pending bits at begin, clone-on-write for mutators, capture at end).

pub mod cachefile;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use ftx_error::{FtxError, Result};
use ftx_types::{Filenum, Lsn};

pub use cachefile::{CachePage, Cachefile, PageCodec};

/// The set of open cachefiles plus the open/close lock the checkpoint
/// driver holds while marking pages pending.
pub struct Cachetable {
    dir: PathBuf,
    open_close_lock: Mutex<()>,
    files: Mutex<BTreeMap<Filenum, Arc<Cachefile>>>,
    next_filenum: AtomicU32,
}

impl Cachetable {
    /// Create a cachetable rooted at `dir` (cachefile inames are resolved
    /// relative to it).
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            open_close_lock: Mutex::new(()),
            files: Mutex::new(BTreeMap::new()),
            next_filenum: AtomicU32::new(1),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// The cachefile open/close lock. The checkpoint driver holds this
    /// while pending bits are set so no file appears or vanishes mid-mark.
    pub fn open_close_lock(&self) -> MutexGuard<'_, ()> {
        self.open_close_lock.lock()
    }

    /// Reserve a filenum for a new cachefile.
    pub fn reserve_filenum(&self) -> Filenum {
        Filenum(self.next_filenum.fetch_add(1, Ordering::Relaxed))
    }

    /// Open (or create) a cachefile named `iname`.
    ///
    /// `filenum` is `None` for normal opens (a fresh number is assigned) and
    /// pinned to a specific value during recovery replay. See
    /// [`Cachefile::open`] for `max_acceptable_lsn`.
    pub fn open_cachefile(
        &self,
        iname: &str,
        filenum: Option<Filenum>,
        codec: Arc<dyn PageCodec>,
        max_acceptable_lsn: Lsn,
    ) -> Result<Arc<Cachefile>> {
        let _oc = self.open_close_lock.lock();
        let filenum = match filenum {
            Some(f) => {
                // Keep later assignments clear of recovery-pinned numbers.
                self.next_filenum
                    .fetch_max(f.get() + 1, Ordering::Relaxed);
                f
            }
            None => self.reserve_filenum(),
        };
        let mut files = self.files.lock();
        if files.contains_key(&filenum) {
            return Err(FtxError::internal(format!(
                "filenum {} already open",
                filenum.get()
            )));
        }
        if files.values().any(|cf| cf.iname() == iname) {
            return Err(FtxError::Busy);
        }
        let path = self.dir.join(iname);
        let cf = Arc::new(Cachefile::open(
            filenum,
            iname,
            &path,
            codec,
            max_acceptable_lsn,
        )?);
        files.insert(filenum, Arc::clone(&cf));
        debug!(iname, filenum = filenum.get(), "cachefile opened");
        Ok(cf)
    }

    /// Close a cachefile, unlinking its backing file if requested.
    pub fn close_cachefile(&self, filenum: Filenum) -> Result<()> {
        let _oc = self.open_close_lock.lock();
        let cf = self
            .files
            .lock()
            .remove(&filenum)
            .ok_or(FtxError::NotFound)?;
        if cf.unlink_on_close() {
            match std::fs::remove_file(cf.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(iname = cf.iname(), filenum = filenum.get(), "cachefile closed");
        Ok(())
    }

    /// Look up an open cachefile by filenum.
    #[must_use]
    pub fn get(&self, filenum: Filenum) -> Option<Arc<Cachefile>> {
        self.files.lock().get(&filenum).cloned()
    }

    /// Look up an open cachefile by iname.
    #[must_use]
    pub fn get_by_iname(&self, iname: &str) -> Option<Arc<Cachefile>> {
        self.files
            .lock()
            .values()
            .find(|cf| cf.iname() == iname)
            .cloned()
    }

    /// Every open cachefile, in filenum order.
    #[must_use]
    pub fn list_open(&self) -> Vec<Arc<Cachefile>> {
        self.files.lock().values().cloned().collect()
    }

    /// Checkpoint begin, page-cache side: mark every dirty page of every
    /// open cachefile pending and snapshot headers at `lsn`. The caller
    /// (the checkpoint driver) holds the multi-operation writer and the
    /// open/close lock.
    pub fn begin_checkpoint_pages(&self, lsn: Lsn) -> usize {
        let files = self.files.lock();
        let mut marked = 0;
        for cf in files.values() {
            marked += cf.begin_checkpoint_pages(lsn);
        }
        info!(pages = marked, lsn = %lsn, "checkpoint pending bits set");
        marked
    }

    /// Checkpoint end, page-cache side: stream every captured page to disk
    /// and fsync the files. Runs concurrently with normal traffic.
    pub fn end_checkpoint_pages(&self) -> Result<()> {
        let files: Vec<Arc<Cachefile>> = self.list_open();
        for cf in files {
            cf.end_checkpoint_pages()?;
        }
        Ok(())
    }
}
