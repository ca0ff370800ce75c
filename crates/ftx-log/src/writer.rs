//! Append-only log writer.
//!
//! Appends go into an in-memory input buffer guarded by its own mutex;
//! moving buffered bytes to disk and fsyncing happens under a separate
//! output mutex, so an appending thread never blocks behind a concurrent
//! fsync of older bytes. Fsync is never implicit: callers request it with
//! an LSN and the writer syncs only if the on-disk position is behind.
//!
//! A failed write or sync latches the writer into a panicked state; every
//! later call returns the saved code.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use ftx_error::{FtxError, Result};
use ftx_types::Lsn;

use crate::record::LogRecord;
use crate::segment::{list_segments, scan_segment, segment_file_name};

/// Default soft maximum segment size (bytes) before rolling to a new file.
pub const DEFAULT_LG_MAX: u64 = 32 * 1024 * 1024;

/// Code latched when an I/O error has no OS errno.
const PANIC_EINVAL: i32 = 22;

struct InputBuffer {
    buf: Vec<u8>,
    /// LSN the next append will receive.
    next_lsn: Lsn,
    /// Highest LSN currently sitting in `buf`.
    buf_max_lsn: Lsn,
}

struct ClosedSegment {
    index: u64,
    path: PathBuf,
    max_lsn: Lsn,
}

struct OutputState {
    file: Option<File>,
    file_index: u64,
    file_path: PathBuf,
    bytes_in_file: u64,
    max_lsn_in_file: Lsn,
    /// Highest LSN known durable on disk.
    synced_lsn: Lsn,
    older: Vec<ClosedSegment>,
}

/// The append-only segmented log writer.
pub struct LogWriter {
    dir: PathBuf,
    lg_max: u64,
    panicked: AtomicI32,
    input: Mutex<InputBuffer>,
    output: Mutex<OutputState>,
}

impl LogWriter {
    /// Open the log directory, scanning existing segments to find the last
    /// assigned LSN and the next unused segment index.
    pub fn open(dir: &Path, lg_max: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;

        let mut older = Vec::with_capacity(segments.len());
        let mut last_lsn = Lsn::ZERO;
        let mut next_index = 0_u64;
        let count = segments.len();
        for (i, (index, path)) in segments.into_iter().enumerate() {
            let data = std::fs::read(&path)?;
            let is_last = i + 1 == count;
            let scan = scan_segment(&data, is_last)?;
            if scan.valid_len < data.len() {
                // Torn tail from a crash mid-write. Truncate it away so a
                // later scan of this (no longer last) segment stays valid.
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len as u64)?;
                file.sync_all()?;
            }
            if let Some(lsn) = scan.last_lsn {
                last_lsn = last_lsn.max(lsn);
            }
            older.push(ClosedSegment {
                index,
                path,
                max_lsn: scan.last_lsn.unwrap_or(Lsn::ZERO),
            });
            next_index = index + 1;
        }

        info!(
            dir = %dir.display(),
            segments = older.len(),
            last_lsn = %last_lsn,
            "log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            lg_max,
            panicked: AtomicI32::new(0),
            input: Mutex::new(InputBuffer {
                buf: Vec::new(),
                next_lsn: last_lsn.next(),
                buf_max_lsn: Lsn::ZERO,
            }),
            output: Mutex::new(OutputState {
                file: None,
                file_index: next_index,
                file_path: dir.join(segment_file_name(next_index)),
                bytes_in_file: 0,
                max_lsn_in_file: Lsn::ZERO,
                synced_lsn: last_lsn,
                older,
            }),
        })
    }

    /// The log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_panicked(&self) -> Result<()> {
        let code = self.panicked.load(Ordering::Acquire);
        if code == 0 {
            Ok(())
        } else {
            Err(FtxError::Panicked(code))
        }
    }

    fn latch_panic(&self, err: &std::io::Error) {
        let code = err.raw_os_error().unwrap_or(PANIC_EINVAL);
        self.panicked.store(code, Ordering::Release);
        tracing::error!(code, error = %err, "log writer panicked");
    }

    /// Append a record, assigning it the next LSN. The record is buffered;
    /// nothing is written or synced here.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        self.check_panicked()?;
        let mut input = self.input.lock();
        let lsn = input.next_lsn;
        input.next_lsn = lsn.next();
        record.set_lsn(lsn);
        let framed = record.encode_framed();
        input.buf.extend_from_slice(&framed);
        input.buf_max_lsn = lsn;
        debug!(lsn = %lsn, cmd = record.cmd_name(), bytes = framed.len(), "log append");
        Ok(lsn)
    }

    /// Highest LSN assigned so far (`ZERO` if none).
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        let input = self.input.lock();
        Lsn(input.next_lsn.get() - 1)
    }

    /// Move buffered bytes into the current segment file, rolling to a new
    /// segment when the current one exceeds `lg_max`. Caller holds `output`.
    fn flush_buffered(&self, output: &mut OutputState) -> Result<()> {
        let (bytes, buf_max_lsn) = {
            let mut input = self.input.lock();
            let bytes = std::mem::take(&mut input.buf);
            let max = input.buf_max_lsn;
            (bytes, max)
        };
        if bytes.is_empty() {
            return Ok(());
        }

        if output.bytes_in_file > self.lg_max {
            self.roll_segment(output)?;
        }

        if output.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&output.file_path)
                .inspect_err(|e| self.latch_panic(e))?;
            output.file = Some(file);
        }
        {
            let file = output.file.as_ref().ok_or_else(|| {
                FtxError::internal("log segment file missing after open")
            })?;
            file.write_all_at(&bytes, output.bytes_in_file)
                .inspect_err(|e| self.latch_panic(e))?;
        }
        output.bytes_in_file += bytes.len() as u64;
        output.max_lsn_in_file = output.max_lsn_in_file.max(buf_max_lsn);
        Ok(())
    }

    fn roll_segment(&self, output: &mut OutputState) -> Result<()> {
        if let Some(file) = output.file.take() {
            file.sync_all().inspect_err(|e| self.latch_panic(e))?;
            output.older.push(ClosedSegment {
                index: output.file_index,
                path: output.file_path.clone(),
                max_lsn: output.max_lsn_in_file,
            });
        }
        output.file_index += 1;
        output.file_path = self.dir.join(segment_file_name(output.file_index));
        output.bytes_in_file = 0;
        output.max_lsn_in_file = Lsn::ZERO;
        debug!(index = output.file_index, "log rolled to new segment");
        Ok(())
    }

    /// Make everything up to `lsn` durable, unless it already is.
    pub fn fsync_if_lsn_not_fsynced(&self, lsn: Lsn) -> Result<()> {
        self.check_panicked()?;
        if lsn.is_zero() {
            return Ok(());
        }
        let mut output = self.output.lock();
        if output.synced_lsn >= lsn {
            return Ok(());
        }
        self.flush_buffered(&mut output)?;
        if let Some(file) = output.file.as_ref() {
            file.sync_all().inspect_err(|e| self.latch_panic(e))?;
        }
        output.synced_lsn = output.synced_lsn.max(output.max_lsn_in_file);
        debug!(synced = %output.synced_lsn, "log fsync");
        Ok(())
    }

    /// Flush and sync everything buffered, regardless of position.
    pub fn fsync(&self) -> Result<()> {
        let lsn = self.last_lsn();
        self.fsync_if_lsn_not_fsynced(lsn)
    }

    /// Unlink every closed segment whose highest LSN is at or below
    /// `trim_lsn` (the last completed checkpoint's LSN). The active segment
    /// is never trimmed.
    pub fn maybe_trim(&self, trim_lsn: Lsn) -> Result<()> {
        if trim_lsn.is_zero() {
            return Ok(());
        }
        let mut output = self.output.lock();
        let mut kept = Vec::with_capacity(output.older.len());
        let mut trimmed = 0_usize;
        for seg in output.older.drain(..) {
            if !seg.max_lsn.is_zero() && seg.max_lsn <= trim_lsn {
                std::fs::remove_file(&seg.path)?;
                trimmed += 1;
            } else {
                kept.push(seg);
            }
        }
        output.older = kept;
        if trimmed > 0 {
            info!(trimmed, trim_lsn = %trim_lsn, "log segments trimmed");
        }
        Ok(())
    }

    /// Resume logging after recovery: the next append receives
    /// `last_lsn + 1`. The replay itself never appends, so the buffer must
    /// be empty.
    pub fn restart(&self, last_lsn: Lsn) -> Result<()> {
        self.check_panicked()?;
        let mut input = self.input.lock();
        if !input.buf.is_empty() {
            return Err(FtxError::internal("log restart with buffered records"));
        }
        input.next_lsn = last_lsn.next();
        info!(last_lsn = %last_lsn, "log restarted");
        Ok(())
    }

    /// Flush and sync on clean close.
    pub fn close(&self) -> Result<()> {
        self.fsync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::LogCursor;
    use ftx_types::{Txnid, TxnidPair};

    fn xbegin(id: u64) -> LogRecord {
        LogRecord::Xbegin {
            lsn: Lsn::ZERO,
            xid: TxnidPair::root(Txnid(id)),
            parent_xid: TxnidPair::NONE,
        }
    }

    #[test]
    fn test_append_assigns_monotone_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let w = LogWriter::open(dir.path(), DEFAULT_LG_MAX).unwrap();
        let a = w.append(xbegin(1)).unwrap();
        let b = w.append(xbegin(2)).unwrap();
        assert_eq!(a, Lsn(1));
        assert_eq!(b, Lsn(2));
        assert_eq!(w.last_lsn(), Lsn(2));
    }

    #[test]
    fn test_fsync_then_reopen_continues_lsns() {
        let dir = tempfile::tempdir().unwrap();
        {
            let w = LogWriter::open(dir.path(), DEFAULT_LG_MAX).unwrap();
            for i in 1..=5 {
                w.append(xbegin(i)).unwrap();
            }
            w.fsync().unwrap();
        }
        let w = LogWriter::open(dir.path(), DEFAULT_LG_MAX).unwrap();
        assert_eq!(w.last_lsn(), Lsn(5));
        let next = w.append(xbegin(6)).unwrap();
        assert_eq!(next, Lsn(6));
    }

    #[test]
    fn test_fsync_if_lsn_not_fsynced_skips_when_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let w = LogWriter::open(dir.path(), DEFAULT_LG_MAX).unwrap();
        let lsn = w.append(xbegin(1)).unwrap();
        w.fsync_if_lsn_not_fsynced(lsn).unwrap();
        // Already durable; a second request is a no-op.
        w.fsync_if_lsn_not_fsynced(lsn).unwrap();
        w.fsync_if_lsn_not_fsynced(Lsn::ZERO).unwrap();
    }

    #[test]
    fn test_segment_rollover_and_trim() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny lg_max so every fsync rolls a segment.
        let w = LogWriter::open(dir.path(), 64).unwrap();
        let mut last = Lsn::ZERO;
        for i in 1..=20 {
            last = w.append(xbegin(i)).unwrap();
            w.fsync().unwrap();
        }
        let before = list_segments(dir.path()).unwrap().len();
        assert!(before > 1, "expected multiple segments, got {before}");

        w.maybe_trim(last).unwrap();
        let after = list_segments(dir.path()).unwrap().len();
        assert!(after < before, "trim removed nothing: {before} -> {after}");

        // All surviving records still parse.
        let mut cursor = LogCursor::create(dir.path()).unwrap();
        let rec = cursor.last().unwrap().unwrap();
        assert_eq!(rec.lsn(), last);
    }

    #[test]
    fn test_restart_rejects_buffered_records() {
        let dir = tempfile::tempdir().unwrap();
        let w = LogWriter::open(dir.path(), DEFAULT_LG_MAX).unwrap();
        w.append(xbegin(1)).unwrap();
        assert!(w.restart(Lsn(1)).is_err());
        w.fsync().unwrap();
        w.restart(Lsn(9)).unwrap();
        assert_eq!(w.append(xbegin(2)).unwrap(), Lsn(10));
    }
}
