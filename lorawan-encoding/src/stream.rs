//! Position-tracked little-endian reader/writer over a bounded buffer.
//!
//! Mirrors the original C stack's `ldl_stream` module: once an operation over/underflows the
//! buffer, a sticky error flag is set. Every later operation on the same stream keeps returning
//! `false` (and advancing `pos` logically for writes, not at all for reads) so callers can decode
//! or encode an entire frame and check [`Stream::error`] exactly once at the end instead of
//! threading a `Result` through every field access.

/// A read/write cursor over a caller-owned byte buffer.
///
/// EUIs are written and read reversed (LoRaWAN transmits EUI-64s in network/reversed order while
/// every other multi-byte field is little-endian).
pub struct Stream<'a> {
    buf: &'a mut [u8],
    pos: usize,
    error: bool,
}

/// A read-only cursor, used for decoding payloads the caller does not own mutably (e.g. a
/// borrowed radio receive buffer).
pub struct ReadStream<'a> {
    buf: &'a [u8],
    pos: usize,
    error: bool,
}

impl<'a> Stream<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0, error: false }
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek_set(&mut self, offset: usize) -> bool {
        if offset <= self.buf.len() {
            self.pos = offset;
            true
        } else {
            false
        }
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> bool {
        if self.error {
            return false;
        }
        if self.remaining() >= value.len() {
            let end = self.pos + value.len();
            self.buf[self.pos..end].copy_from_slice(value);
            self.pos = end;
            true
        } else {
            self.error = true;
            false
        }
    }

    pub fn put_u8(&mut self, value: u8) -> bool {
        self.put_bytes(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> bool {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u24(&mut self, value: u32) -> bool {
        let b = value.to_le_bytes();
        self.put_bytes(&b[..3])
    }

    pub fn put_u32(&mut self, value: u32) -> bool {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes an 8-byte EUI reversed (network order on the air).
    pub fn put_eui(&mut self, value: &[u8; 8]) -> bool {
        let mut reversed = *value;
        reversed.reverse();
        self.put_bytes(&reversed)
    }

    /// Overwrites 4 bytes at an already-written position (used to patch in a MIC once computed).
    pub fn put_u32_at(&mut self, offset: usize, value: u32) -> bool {
        if offset + 4 <= self.buf.len() {
            self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            true
        } else {
            false
        }
    }

    pub fn as_written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn as_written_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.pos]
    }
}

impl<'a> ReadStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, error: false }
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek_set(&mut self, offset: usize) -> bool {
        if offset <= self.buf.len() {
            self.pos = offset;
            true
        } else {
            false
        }
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn get_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        if self.error {
            return None;
        }
        if self.remaining() >= count {
            let slice = &self.buf[self.pos..self.pos + count];
            self.pos += count;
            Some(slice)
        } else {
            self.error = true;
            None
        }
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        self.get_bytes(1).map(|b| b[0])
    }

    pub fn get_u16(&mut self) -> Option<u16> {
        self.get_bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u24(&mut self) -> Option<u32> {
        self.get_bytes(3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_eui(&mut self) -> Option<[u8; 8]> {
        self.get_bytes(8).map(|b| {
            let mut out = [0u8; 8];
            out.copy_from_slice(b);
            out.reverse();
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut buf = [0u8; 16];
        {
            let mut w = Stream::new(&mut buf);
            assert!(w.put_u8(0xAB));
            assert!(w.put_u16(0x1234));
            assert!(w.put_u24(0x0203_04));
            assert!(w.put_u32(0xDEAD_BEEF));
            assert!(!w.error());
        }
        let mut r = ReadStream::new(&buf[..10]);
        assert_eq!(r.get_u8(), Some(0xAB));
        assert_eq!(r.get_u16(), Some(0x1234));
        assert_eq!(r.get_u24(), Some(0x0203_04));
        assert_eq!(r.get_u32(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn eui_round_trips_reversed_on_wire() {
        let mut buf = [0u8; 8];
        let eui = [1, 2, 3, 4, 5, 6, 7, 8];
        {
            let mut w = Stream::new(&mut buf);
            w.put_eui(&eui);
        }
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
        let mut r = ReadStream::new(&buf);
        assert_eq!(r.get_eui(), Some(eui));
    }

    #[test]
    fn sticky_error_after_overflow() {
        let mut buf = [0u8; 2];
        let mut w = Stream::new(&mut buf);
        assert!(w.put_u8(1));
        assert!(w.put_u8(2));
        assert!(!w.put_u8(3));
        assert!(w.error());
        // once tripped, further writes keep failing even if space "reappears" logically
        assert!(!w.put_u8(4));
    }

    #[test]
    fn sticky_error_after_underflow() {
        let buf = [1u8, 2];
        let mut r = ReadStream::new(&buf);
        assert_eq!(r.get_u16(), Some(0x0201));
        assert_eq!(r.get_u8(), None);
        assert!(r.error());
    }
}
