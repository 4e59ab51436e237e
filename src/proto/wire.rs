//! Checked little-endian primitives shared by every payload schema.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::CodecError;

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated(what))
        }
        let buf: &'a [u8] = self.buf;
        let (head, rest) = buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self, what: &'static str) -> Result<i32, CodecError> {
        Ok(self.u32(what)? as i32)
    }

    pub(crate) fn i64(&mut self, what: &'static str) -> Result<i64, CodecError> {
        let b = self.take(8, what)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub(crate) fn boolean(&mut self, what: &'static str) -> Result<bool, CodecError> {
        Ok(self.u8(what)? != 0)
    }

    pub(crate) fn uuid(&mut self, what: &'static str) -> Result<Uuid, CodecError> {
        let b = self.take(16, what)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    pub(crate) fn string(&mut self, what: &'static str) -> Result<String, CodecError> {
        let len = self.u16(what)? as usize;
        let b = self.take(len, what)?;
        std::str::from_utf8(b).map(str::to_owned).map_err(|_| CodecError::InvalidUtf8(what))
    }

    pub(crate) fn opt_string(&mut self, what: &'static str) -> Result<Option<String>, CodecError> {
        if self.boolean(what)? {
            Ok(Some(self.string(what)?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn bytes(&mut self, what: &'static str) -> Result<Vec<u8>, CodecError> {
        let len = self.u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    pub(crate) fn raw(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        self.take(n, what)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }
}

pub(crate) struct Writer<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub(crate) fn i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub(crate) fn i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub(crate) fn boolean(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub(crate) fn uuid(&mut self, v: Uuid) {
        self.buf.put_slice(v.as_bytes());
    }

    pub(crate) fn string(&mut self, v: &str) {
        // string fields are facade-validated identifiers and short messages
        let len = u16::try_from(v.len()).expect("string field exceeds u16::MAX bytes");
        self.buf.put_u16_le(len);
        self.buf.put_slice(v.as_bytes());
    }

    pub(crate) fn opt_string(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.boolean(true);
                self.string(s);
            }
            None => self.boolean(false),
        }
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) {
        let len = u32::try_from(v.len()).expect("byte field exceeds u32::MAX bytes");
        self.buf.put_u32_le(len);
        self.buf.put_slice(v);
    }

    pub(crate) fn raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = BytesMut::new();
        let id = Uuid::new_v4();
        {
            let mut w = Writer::new(&mut buf);
            w.u8(7);
            w.i64(-42);
            w.boolean(true);
            w.uuid(id);
            w.string("stream-1");
            w.opt_string(None);
            w.opt_string(Some("why"));
            w.bytes(b"payload");
        }

        let mut r = Reader::new(&buf);
        assert_eq!(r.u8("a").unwrap(), 7);
        assert_eq!(r.i64("b").unwrap(), -42);
        assert!(r.boolean("c").unwrap());
        assert_eq!(r.uuid("d").unwrap(), id);
        assert_eq!(r.string("e").unwrap(), "stream-1");
        assert_eq!(r.opt_string("f").unwrap(), None);
        assert_eq!(r.opt_string("g").unwrap().as_deref(), Some("why"));
        assert_eq!(r.bytes("h").unwrap(), b"payload");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_reads_name_the_field() {
        let mut r = Reader::new(&[0x01]);
        assert!(matches!(r.i64("sequence"), Err(CodecError::Truncated("sequence"))));
    }
}
