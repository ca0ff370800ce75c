//! Fixed-layout big-endian buffer primitives for log records and rollback
//! pages. The framing (checksums, lengths) is owned by the callers.

use ftx_error::{FtxError, Result};
use ftx_types::{Blocknum, Filenum, Lsn, Txnid, TxnidPair, XA_XID_DATA_MAX, XaXid, Xids};

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only byte writer.
#[derive(Debug, Default)]
pub struct Wbuf {
    buf: Vec<u8>,
}

impl Wbuf {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    pub fn put_lsn(&mut self, v: Lsn) {
        self.put_u64(v.get());
    }

    pub fn put_txnid(&mut self, v: Txnid) {
        self.put_u64(v.get());
    }

    pub fn put_txnid_pair(&mut self, v: TxnidPair) {
        self.put_txnid(v.parent_id64);
        self.put_txnid(v.child_id64);
    }

    pub fn put_blocknum(&mut self, v: Blocknum) {
        self.put_i64(v.get());
    }

    pub fn put_filenum(&mut self, v: Filenum) {
        self.put_u32(v.get());
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_filenums(&mut self, v: &[Filenum]) {
        self.put_u32(v.len() as u32);
        for f in v {
            self.put_filenum(*f);
        }
    }

    pub fn put_xids(&mut self, v: &Xids) {
        self.put_u32(v.depth() as u32);
        for id in v.ids() {
            self.put_txnid(*id);
        }
    }

    pub fn put_xa_xid(&mut self, v: &XaXid) {
        self.put_i32(v.format_id);
        self.put_u32(v.gtrid_length);
        self.put_u32(v.bqual_length);
        self.put_bytes(v.payload());
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Forward-only byte reader over a borrowed slice. Every accessor is
/// bounds-checked and surfaces a short read as corruption.
#[derive(Debug)]
pub struct Rbuf<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Rbuf<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(FtxError::run_recovery(format!(
                "short read: wanted {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn(self.get_u64()?))
    }

    pub fn get_txnid(&mut self) -> Result<Txnid> {
        Ok(Txnid(self.get_u64()?))
    }

    pub fn get_txnid_pair(&mut self) -> Result<TxnidPair> {
        let parent = self.get_txnid()?;
        let child = self.get_txnid()?;
        Ok(TxnidPair {
            parent_id64: parent,
            child_id64: child,
        })
    }

    pub fn get_blocknum(&mut self) -> Result<Blocknum> {
        Ok(Blocknum(self.get_i64()?))
    }

    pub fn get_filenum(&mut self) -> Result<Filenum> {
        Ok(Filenum(self.get_u32()?))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_filenums(&mut self) -> Result<Vec<Filenum>> {
        let n = self.get_u32()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.get_filenum()?);
        }
        Ok(out)
    }

    pub fn get_xids(&mut self) -> Result<Xids> {
        let n = self.get_u32()? as usize;
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.get_txnid()?);
        }
        Ok(Xids::from_ids(ids))
    }

    pub fn get_xa_xid(&mut self) -> Result<XaXid> {
        let format_id = self.get_i32()?;
        let gtrid_length = self.get_u32()?;
        let bqual_length = self.get_u32()?;
        let payload = self.get_bytes()?;
        if payload.len() != (gtrid_length + bqual_length) as usize
            || payload.len() > XA_XID_DATA_MAX
        {
            return Err(FtxError::run_recovery("malformed XA xid payload"));
        }
        let mut data = [0_u8; XA_XID_DATA_MAX];
        data[..payload.len()].copy_from_slice(&payload);
        Ok(XaXid {
            format_id,
            gtrid_length,
            bqual_length,
            data,
        })
    }

    /// Fails unless the whole buffer was consumed.
    pub fn expect_consumed(&self, what: &str) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(FtxError::run_recovery(format!(
                "{what}: {} trailing bytes",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = Wbuf::new();
        w.put_u8(7);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(u64::MAX - 1);
        w.put_i64(-42);
        w.put_bool(true);
        w.put_bytes(b"hello");

        let bytes = w.into_inner();
        let mut r = Rbuf::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_bytes().unwrap(), b"hello");
        r.expect_consumed("test").unwrap();
    }

    #[test]
    fn test_short_read_is_corruption() {
        let bytes = [0_u8; 3];
        let mut r = Rbuf::new(&bytes);
        let err = r.get_u32().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_xids_roundtrip() {
        let xids = Xids::root().push_child(Txnid(3)).push_child(Txnid(9));
        let mut w = Wbuf::new();
        w.put_xids(&xids);
        let bytes = w.into_inner();
        let mut r = Rbuf::new(&bytes);
        assert_eq!(r.get_xids().unwrap(), xids);
    }

    #[test]
    fn test_xa_xid_roundtrip() {
        let xid = XaXid::new(1, b"gtrid", b"bq");
        let mut w = Wbuf::new();
        w.put_xa_xid(&xid);
        let bytes = w.into_inner();
        let mut r = Rbuf::new(&bytes);
        assert_eq!(r.get_xa_xid().unwrap(), xid);
    }
}
