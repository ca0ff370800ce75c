//! Forward and backward iteration over the segment directory.
//!
//! The cursor loads one segment's bytes at a time and walks its record
//! offsets; backward iteration relies on every record's trailing length.
//! A torn tail on the final segment is discarded silently (normal crash
//! truncation); any other parse failure is corruption.

use std::path::{Path, PathBuf};

use ftx_error::Result;
use ftx_types::Lsn;

use crate::record::LogRecord;
use crate::segment::{list_segments, scan_segment};

struct SegmentSlot {
    path: PathBuf,
    /// Populated while the cursor is positioned inside this segment.
    loaded: Option<LoadedSegment>,
}

struct LoadedSegment {
    data: Vec<u8>,
    offsets: Vec<usize>,
}

/// Cursor over every record in a log directory.
pub struct LogCursor {
    segments: Vec<SegmentSlot>,
    /// `(segment index, record index)` of the current position.
    pos: Option<(usize, usize)>,
}

impl LogCursor {
    /// Open a cursor over `dir`. Creating a cursor on an empty or missing
    /// directory succeeds; iteration simply yields nothing.
    pub fn create(dir: &Path) -> Result<Self> {
        let segments = list_segments(dir)?
            .into_iter()
            .map(|(_, path)| SegmentSlot { path, loaded: None })
            .collect();
        Ok(Self {
            segments,
            pos: None,
        })
    }

    /// Whether the directory holds any log segments at all.
    #[must_use]
    pub fn log_exists(&self) -> bool {
        !self.segments.is_empty()
    }

    fn ensure_loaded(&mut self, seg: usize) -> Result<()> {
        if self.segments[seg].loaded.is_some() {
            return Ok(());
        }
        let is_last = seg + 1 == self.segments.len();
        let data = std::fs::read(&self.segments[seg].path)?;
        let scan = scan_segment(&data, is_last)?;
        self.segments[seg].loaded = Some(LoadedSegment {
            data,
            offsets: scan.offsets,
        });
        Ok(())
    }

    fn unload_except(&mut self, keep: usize) {
        for (i, slot) in self.segments.iter_mut().enumerate() {
            if i != keep {
                slot.loaded = None;
            }
        }
    }

    fn record_at(&self, seg: usize, idx: usize) -> Result<LogRecord> {
        let loaded = self.segments[seg]
            .loaded
            .as_ref()
            .expect("segment must be loaded");
        let offset = loaded.offsets[idx];
        let (rec, _) = LogRecord::decode_framed(&loaded.data[offset..])?;
        Ok(rec)
    }

    fn record_count(&self, seg: usize) -> usize {
        self.segments[seg]
            .loaded
            .as_ref()
            .map_or(0, |l| l.offsets.len())
    }

    /// Position at the first record and return it.
    pub fn first(&mut self) -> Result<Option<LogRecord>> {
        self.pos = None;
        for seg in 0..self.segments.len() {
            self.ensure_loaded(seg)?;
            if self.record_count(seg) > 0 {
                self.unload_except(seg);
                self.pos = Some((seg, 0));
                return Ok(Some(self.record_at(seg, 0)?));
            }
        }
        Ok(None)
    }

    /// Advance and return the next record, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        let Some((mut seg, mut idx)) = self.pos else {
            return self.first();
        };
        idx += 1;
        loop {
            self.ensure_loaded(seg)?;
            if idx < self.record_count(seg) {
                self.unload_except(seg);
                self.pos = Some((seg, idx));
                return Ok(Some(self.record_at(seg, idx)?));
            }
            seg += 1;
            idx = 0;
            if seg >= self.segments.len() {
                return Ok(None);
            }
        }
    }

    /// Position at the last record and return it.
    pub fn last(&mut self) -> Result<Option<LogRecord>> {
        self.pos = None;
        for seg in (0..self.segments.len()).rev() {
            self.ensure_loaded(seg)?;
            let count = self.record_count(seg);
            if count > 0 {
                self.unload_except(seg);
                self.pos = Some((seg, count - 1));
                return Ok(Some(self.record_at(seg, count - 1)?));
            }
        }
        Ok(None)
    }

    /// Step backward and return the previous record, or `None` at the
    /// beginning.
    pub fn prev(&mut self) -> Result<Option<LogRecord>> {
        let Some((mut seg, idx)) = self.pos else {
            return self.last();
        };
        if idx > 0 {
            self.ensure_loaded(seg)?;
            self.pos = Some((seg, idx - 1));
            return Ok(Some(self.record_at(seg, idx - 1)?));
        }
        while seg > 0 {
            seg -= 1;
            self.ensure_loaded(seg)?;
            let count = self.record_count(seg);
            if count > 0 {
                self.unload_except(seg);
                self.pos = Some((seg, count - 1));
                return Ok(Some(self.record_at(seg, count - 1)?));
            }
        }
        Ok(None)
    }

    /// LSN of the record at the current position, if positioned.
    pub fn current_lsn(&mut self) -> Result<Option<Lsn>> {
        let Some((seg, idx)) = self.pos else {
            return Ok(None);
        };
        self.ensure_loaded(seg)?;
        Ok(Some(self.record_at(seg, idx)?.lsn()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{DEFAULT_LG_MAX, LogWriter};
    use ftx_types::{Txnid, TxnidPair};

    fn write_n(dir: &Path, n: u64, lg_max: u64) {
        let w = LogWriter::open(dir, lg_max).unwrap();
        for i in 1..=n {
            w.append(LogRecord::Xbegin {
                lsn: Lsn::ZERO,
                xid: TxnidPair::root(Txnid(i)),
                parent_xid: TxnidPair::NONE,
            })
            .unwrap();
        }
        w.fsync().unwrap();
    }

    #[test]
    fn test_forward_iteration_in_lsn_order() {
        let dir = tempfile::tempdir().unwrap();
        write_n(dir.path(), 10, DEFAULT_LG_MAX);

        let mut c = LogCursor::create(dir.path()).unwrap();
        let mut expect = 1_u64;
        let mut rec = c.first().unwrap();
        while let Some(r) = rec {
            assert_eq!(r.lsn(), Lsn(expect));
            expect += 1;
            rec = c.next().unwrap();
        }
        assert_eq!(expect, 11);
    }

    #[test]
    fn test_backward_iteration_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        write_n(dir.path(), 10, DEFAULT_LG_MAX);

        let mut c = LogCursor::create(dir.path()).unwrap();
        let mut expect = 10_u64;
        let mut rec = c.last().unwrap();
        while let Some(r) = rec {
            assert_eq!(r.lsn(), Lsn(expect));
            expect -= 1;
            rec = c.prev().unwrap();
        }
        assert_eq!(expect, 0);
    }

    #[test]
    fn test_iteration_spans_segments() {
        let dir = tempfile::tempdir().unwrap();
        // Force many tiny segments.
        {
            let w = LogWriter::open(dir.path(), 64).unwrap();
            for i in 1..=30 {
                w.append(LogRecord::Xbegin {
                    lsn: Lsn::ZERO,
                    xid: TxnidPair::root(Txnid(i)),
                    parent_xid: TxnidPair::NONE,
                })
                .unwrap();
                w.fsync().unwrap();
            }
        }
        let mut c = LogCursor::create(dir.path()).unwrap();
        let mut count = 0;
        let mut rec = c.first().unwrap();
        while rec.is_some() {
            count += 1;
            rec = c.next().unwrap();
        }
        assert_eq!(count, 30);

        let mut back = 0;
        let mut rec = c.last().unwrap();
        while rec.is_some() {
            back += 1;
            rec = c.prev().unwrap();
        }
        assert_eq!(back, 30);
    }

    #[test]
    fn test_empty_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = LogCursor::create(dir.path()).unwrap();
        assert!(!c.log_exists());
        assert!(c.first().unwrap().is_none());
        assert!(c.last().unwrap().is_none());
    }

    #[test]
    fn test_turnaround_prev_then_next() {
        let dir = tempfile::tempdir().unwrap();
        write_n(dir.path(), 5, DEFAULT_LG_MAX);

        let mut c = LogCursor::create(dir.path()).unwrap();
        let last = c.last().unwrap().unwrap();
        assert_eq!(last.lsn(), Lsn(5));
        let prev = c.prev().unwrap().unwrap();
        assert_eq!(prev.lsn(), Lsn(4));
        let next = c.next().unwrap().unwrap();
        assert_eq!(next.lsn(), Lsn(5));
        assert!(c.next().unwrap().is_none());
    }
}
