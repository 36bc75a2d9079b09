//! Sequential read/write cursors over wire buffers.
//!
//! Every frame in the protocol is built and parsed through these two types.
//! Multi-byte integers are big-endian; doubles are IEEE-754 big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Read cursor over an immutable byte buffer.
///
/// Every read advances the offset by the field's width. Reading past the end
/// is a programming or framing error and fails fast instead of returning
/// zeroes.
#[derive(Debug)]
pub struct ReadContext {
    buf: Bytes,
    consumed: usize,
}

impl ReadContext {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, consumed: 0 }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(Error::BufferExhausted { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_f64())
    }

    /// Reads `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        self.consumed += n;
        Ok(self.buf.copy_to_bytes(n))
    }

    /// Reads the next u32 without advancing the cursor.
    pub fn peek_u32(&self) -> Result<u32> {
        self.ensure(4)?;
        let chunk = self.buf.chunk();
        Ok(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Remaining unread bytes.
    pub fn size_left(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_eof(&self) -> bool {
        self.buf.remaining() == 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.consumed
    }
}

/// Write cursor accumulating bytes for one outbound frame.
#[derive(Debug, Default)]
pub struct WriteContext {
    buf: BytesMut,
}

impl WriteContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_typed_fields_advance_offset() {
        let mut ctx = ReadContext::new(Bytes::from_static(&[
            0, 0, 0, 4, // u32
            0, 0, 0, 0, 0, 0, 0, 9, // u64
            0x40, 0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // f64 = 42.0
        ]));

        assert_eq!(ctx.size_left(), 20);
        assert_eq!(ctx.read_u32().unwrap(), 4);
        assert_eq!(ctx.read_u64().unwrap(), 9);
        assert_eq!(ctx.read_f64().unwrap(), 42.0);
        assert_eq!(ctx.position(), 20);
        assert!(ctx.is_eof());
    }

    #[test]
    fn read_past_end_fails_fast() {
        let mut ctx = ReadContext::new(Bytes::from_static(&[1, 2]));

        match ctx.read_u32() {
            Err(Error::BufferExhausted { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected BufferExhausted, got {other:?}"),
        }
        // A failed read must not consume anything.
        assert_eq!(ctx.size_left(), 2);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut ctx = ReadContext::new(Bytes::from_static(&[0, 0, 0, 7, 0xaa]));

        assert_eq!(ctx.peek_u32().unwrap(), 7);
        assert_eq!(ctx.peek_u32().unwrap(), 7);
        assert_eq!(ctx.read_u32().unwrap(), 7);
        assert_eq!(ctx.size_left(), 1);
    }

    #[test]
    fn writer_reader_symmetry() {
        let mut ctx = WriteContext::new();
        ctx.write_u32(0x11223344);
        ctx.write_u64(1);
        ctx.write_f64(128.5);
        ctx.write_bytes(b"abc");
        assert_eq!(ctx.len(), 4 + 8 + 8 + 3);

        let mut reader = ReadContext::new(ctx.into_bytes());
        assert_eq!(reader.read_u32().unwrap(), 0x11223344);
        assert_eq!(reader.read_u64().unwrap(), 1);
        assert_eq!(reader.read_f64().unwrap(), 128.5);
        assert_eq!(&reader.read_bytes(3).unwrap()[..], b"abc");
        assert!(reader.is_eof());
    }

    #[test]
    fn big_endian_on_the_wire() {
        let mut ctx = WriteContext::new();
        ctx.write_u32(1);
        assert_eq!(&ctx.into_bytes()[..], &[0, 0, 0, 1]);
    }
}
