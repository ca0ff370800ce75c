//! Log segment files: naming, directory listing, and record scanning.
//!
//! Segments are named `log<14-digit index>.tokulog<version>`. Indexes are
//! strictly increasing but may have gaps (trimming unlinks old segments).

use std::path::{Path, PathBuf};

use ftx_error::{FtxError, Result};
use ftx_types::Lsn;

use crate::record::LogRecord;

/// Current on-disk log version, embedded in every segment file name.
pub const LOG_VERSION: u32 = 29;

/// File name for segment `index` at the current version.
#[must_use]
pub fn segment_file_name(index: u64) -> String {
    format!("log{index:014}.tokulog{LOG_VERSION}")
}

/// Parse a segment file name into `(index, version)`.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix("log")?;
    if rest.len() < 14 {
        return None;
    }
    let (digits, suffix) = rest.split_at(14);
    let index: u64 = digits.parse().ok()?;
    let version: u32 = suffix.strip_prefix(".tokulog")?.parse().ok()?;
    Some((index, version))
}

/// List segment files in `dir`, sorted by index. A segment at any version
/// other than [`LOG_VERSION`] fails the listing.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((index, version)) = parse_segment_file_name(name) {
            if version != LOG_VERSION {
                return Err(FtxError::BadLogVersion {
                    found: version,
                    expected: LOG_VERSION,
                });
            }
            out.push((index, entry.path()));
        }
    }
    out.sort_by_key(|(index, _)| *index);
    Ok(out)
}

/// Result of scanning one segment's bytes.
#[derive(Debug)]
pub struct SegmentScan {
    /// Byte offset of each valid record, in file order.
    pub offsets: Vec<usize>,
    /// Length of the valid record prefix; trailing bytes past this are a
    /// torn tail.
    pub valid_len: usize,
    /// LSN of the last valid record, if any.
    pub last_lsn: Option<Lsn>,
}

/// Forward-parse `data` into record offsets.
///
/// A parse failure inside the valid region is tolerated only when
/// `allow_torn_tail` is set (the final segment after a crash); everything
/// from the failure point on is then discarded. In any other segment it is
/// corruption.
pub fn scan_segment(data: &[u8], allow_torn_tail: bool) -> Result<SegmentScan> {
    let mut offsets = Vec::new();
    let mut pos = 0_usize;
    let mut last_lsn = None;
    while pos < data.len() {
        match LogRecord::decode_framed(&data[pos..]) {
            Ok((rec, used)) => {
                offsets.push(pos);
                last_lsn = Some(rec.lsn());
                pos += used;
            }
            Err(err) => {
                if allow_torn_tail {
                    tracing::warn!(
                        torn_at = pos,
                        total = data.len(),
                        "discarding torn log tail"
                    );
                    break;
                }
                return Err(err);
            }
        }
    }
    Ok(SegmentScan {
        offsets,
        valid_len: pos,
        last_lsn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftx_types::{Txnid, TxnidPair};

    #[test]
    fn test_segment_name_roundtrip() {
        let name = segment_file_name(42);
        assert_eq!(name, format!("log00000000000042.tokulog{LOG_VERSION}"));
        assert_eq!(parse_segment_file_name(&name), Some((42, LOG_VERSION)));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_segment_file_name("data.db"), None);
        assert_eq!(parse_segment_file_name("log123.tokulog29"), None);
        assert_eq!(
            parse_segment_file_name("__tokudb_recoverylock_dont_delete_me"),
            None
        );
    }

    #[test]
    fn test_scan_segment_torn_tail() {
        let r1 = LogRecord::Xbegin {
            lsn: Lsn(1),
            xid: TxnidPair::root(Txnid(1)),
            parent_xid: TxnidPair::NONE,
        };
        let r2 = LogRecord::Xcommit {
            lsn: Lsn(2),
            xid: TxnidPair::root(Txnid(1)),
        };
        let mut data = r1.encode_framed();
        let full = r2.encode_framed();
        data.extend_from_slice(&full[..full.len() - 5]);

        let scan = scan_segment(&data, true).unwrap();
        assert_eq!(scan.offsets.len(), 1);
        assert_eq!(scan.last_lsn, Some(Lsn(1)));

        let err = scan_segment(&data, false).unwrap_err();
        assert!(err.is_corruption());
    }
}
