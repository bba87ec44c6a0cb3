//! Bounded byte cursor underlying payload serialization and parsing.
//!
//! [`StreamBuffer`] is a fixed-capacity region with a single read/write
//! head. Every operation is atomic: it either advances the cursor fully or
//! fails with [`RanchwireError::Overflow`] without touching the buffer.
//! Writes are bounded by the capacity, reads by the high-water mark, so a
//! read can never leak the zeroed tail of a partially written buffer.
//! `seek` exists so the outbound path can back-patch a header after the
//! payload has been serialized at a fixed offset.
//!
//! On-wire primitives are little-endian integers and C-style strings (raw
//! bytes plus a 0x00 terminator, no length prefix). Collections carry a
//! single length byte (max 255 elements) followed by that many records.

use crate::error::{RanchwireError, Result};

/// Fixed-capacity read/write byte cursor.
pub struct StreamBuffer {
    data: Vec<u8>,
    pos: usize,
    high: usize,
}

impl StreamBuffer {
    /// Create a zeroed buffer with the given capacity, cursor at 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            pos: 0,
            high: 0,
        }
    }

    /// Create a buffer over a copy of `bytes`, cursor at 0, for parsing.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            pos: 0,
            high: bytes.len(),
        }
    }

    /// Total capacity of the region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes between the cursor and the end of the region.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything written so far, regardless of the current cursor
    /// position. This is the frame image after a header back-patch.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.high]
    }

    /// Relocate the cursor. Fails if `position` lies past the capacity.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(RanchwireError::Overflow {
                requested: position,
                position: self.pos,
                capacity: self.data.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn check(&self, count: usize) -> Result<()> {
        if count > self.remaining() {
            return Err(RanchwireError::Overflow {
                requested: count,
                position: self.pos,
                capacity: self.data.len(),
            });
        }
        Ok(())
    }

    fn check_read(&self, count: usize) -> Result<()> {
        if count > self.high.saturating_sub(self.pos) {
            return Err(RanchwireError::Overflow {
                requested: count,
                position: self.pos,
                capacity: self.high,
            });
        }
        Ok(())
    }

    /// Copy `src` at the cursor and advance. Never partially written.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.check(src.len())?;
        self.data[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
        self.high = self.high.max(self.pos);
        Ok(())
    }

    /// Read `count` bytes at the cursor and advance. Never partially read;
    /// bounded by the written extent, not the capacity.
    pub fn read_bytes(&mut self, count: usize) -> Result<&[u8]> {
        self.check_read(count)?;
        let start = self.pos;
        self.pos += count;
        Ok(&self.data[start..self.pos])
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Write a little-endian u16.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write an i8.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian i16.
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian i32.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Read a u8.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read an i8.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a little-endian i16.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Read a little-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Write a string as raw bytes followed by a 0x00 terminator.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.check(value.len() + 1)?;
        self.write_bytes(value.as_bytes())?;
        self.write_u8(0)
    }

    /// Read bytes up to (and consuming) a 0x00 terminator.
    ///
    /// The length is implicit in the terminator; the scan is bounded by
    /// the written extent, so a missing terminator is a decode error
    /// rather than a silent read into the zeroed tail.
    pub fn read_str(&mut self) -> Result<String> {
        let region = self.data.get(self.pos..self.high).unwrap_or(&[]);
        let terminator = region
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RanchwireError::Decode("unterminated string".into()))?;
        let raw = self.read_bytes(terminator)?.to_vec();
        self.read_u8()?;
        String::from_utf8(raw).map_err(|e| RanchwireError::Decode(e.to_string()))
    }

    /// Write a collection as a single length byte followed by each element.
    pub fn write_list<T: WireEncode>(&mut self, items: &[T]) -> Result<()> {
        if items.len() > u8::MAX as usize {
            return Err(RanchwireError::Protocol(format!(
                "collection of {} elements exceeds the 255-element wire limit",
                items.len()
            )));
        }
        self.write_u8(items.len() as u8)?;
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Read a single-length-byte-prefixed collection.
    pub fn read_list<T: WireDecode>(&mut self) -> Result<Vec<T>> {
        let count = self.read_u8()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

/// Serialize a message body into a [`StreamBuffer`].
pub trait WireEncode {
    /// Write this value at the buffer's cursor.
    fn encode(&self, buf: &mut StreamBuffer) -> Result<()>;
}

/// Parse a message body out of a [`StreamBuffer`].
pub trait WireDecode: Sized {
    /// Read a value at the buffer's cursor.
    fn decode(buf: &mut StreamBuffer) -> Result<Self>;
}

macro_rules! wire_int {
    ($ty:ty, $write:ident, $read:ident) => {
        impl WireEncode for $ty {
            fn encode(&self, buf: &mut StreamBuffer) -> Result<()> {
                buf.$write(*self)
            }
        }

        impl WireDecode for $ty {
            fn decode(buf: &mut StreamBuffer) -> Result<Self> {
                buf.$read()
            }
        }
    };
}

wire_int!(u8, write_u8, read_u8);
wire_int!(u16, write_u16, read_u16);
wire_int!(u32, write_u32, read_u32);
wire_int!(i8, write_i8, read_i8);
wire_int!(i16, write_i16, read_i16);
wire_int!(i32, write_i32, read_i32);

impl WireEncode for String {
    fn encode(&self, buf: &mut StreamBuffer) -> Result<()> {
        buf.write_str(self)
    }
}

impl WireDecode for String {
    fn decode(buf: &mut StreamBuffer) -> Result<Self> {
        buf.read_str()
    }
}

impl WireEncode for &str {
    fn encode(&self, buf: &mut StreamBuffer) -> Result<()> {
        buf.write_str(self)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut StreamBuffer) -> Result<()> {
        buf.write_list(self)
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut StreamBuffer) -> Result<Self> {
        buf.read_list()
    }
}

/// Payload-less commands decode from nothing and encode to nothing.
impl WireEncode for () {
    fn encode(&self, _buf: &mut StreamBuffer) -> Result<()> {
        Ok(())
    }
}

impl WireDecode for () {
    fn decode(_buf: &mut StreamBuffer) -> Result<Self> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_at_exact_capacity_succeeds() {
        let mut buf = StreamBuffer::new(8);
        assert!(buf.write_bytes(&[0xAA; 8]).is_ok());
        assert_eq!(buf.position(), 8);
    }

    #[test]
    fn write_past_capacity_fails_cleanly() {
        let mut buf = StreamBuffer::new(8);
        let err = buf.write_bytes(&[0xAA; 9]).unwrap_err();
        assert!(matches!(
            err,
            RanchwireError::Overflow {
                requested: 9,
                position: 0,
                capacity: 8
            }
        ));
        // Nothing was written.
        assert_eq!(buf.position(), 0);
        assert!(buf.filled().is_empty());
    }

    #[test]
    fn read_past_capacity_fails_cleanly() {
        let mut buf = StreamBuffer::from_slice(&[1, 2, 3]);
        assert!(buf.read_bytes(4).is_err());
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.read_bytes(3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn reads_stop_at_the_written_extent() {
        let mut buf = StreamBuffer::new(16);
        buf.write_u16(7).unwrap();
        buf.seek(0).unwrap();

        assert_eq!(buf.read_u16().unwrap(), 7);
        // The remaining 14 bytes are unwritten, not readable zeroes.
        let err = buf.read_u8().unwrap_err();
        assert!(matches!(err, RanchwireError::Overflow { capacity: 2, .. }));
    }

    #[test]
    fn read_str_does_not_scan_the_unwritten_tail() {
        let mut buf = StreamBuffer::new(16);
        buf.write_bytes(b"abc").unwrap();
        buf.seek(0).unwrap();

        // No terminator was written; the zeroed tail must not supply one.
        let err = buf.read_str().unwrap_err();
        assert!(matches!(err, RanchwireError::Decode(_)));
    }

    #[test]
    fn seek_bounds() {
        let mut buf = StreamBuffer::new(16);
        assert!(buf.seek(16).is_ok());
        assert!(buf.seek(17).is_err());
    }

    #[test]
    fn seek_back_patch_keeps_high_water_mark() {
        let mut buf = StreamBuffer::new(64);
        buf.seek(4).unwrap();
        buf.write_u32(0xDEAD_BEEF).unwrap();
        buf.seek(0).unwrap();
        buf.write_u32(0x1234_5678).unwrap();

        assert_eq!(buf.filled().len(), 8);
        assert_eq!(&buf.filled()[..4], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&buf.filled()[4..], &0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn integers_are_little_endian() {
        let mut buf = StreamBuffer::new(16);
        buf.write_u16(0x0102).unwrap();
        buf.write_u32(0x0304_0506).unwrap();
        assert_eq!(buf.filled(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);

        buf.seek(0).unwrap();
        assert_eq!(buf.read_u16().unwrap(), 0x0102);
        assert_eq!(buf.read_u32().unwrap(), 0x0304_0506);
    }

    #[test]
    fn signed_integers_round_trip() {
        let mut buf = StreamBuffer::new(16);
        buf.write_i8(-1).unwrap();
        buf.write_i16(-2).unwrap();
        buf.write_i32(-3).unwrap();

        buf.seek(0).unwrap();
        assert_eq!(buf.read_i8().unwrap(), -1);
        assert_eq!(buf.read_i16().unwrap(), -2);
        assert_eq!(buf.read_i32().unwrap(), -3);
    }

    #[test]
    fn strings_are_null_terminated() {
        let mut buf = StreamBuffer::new(32);
        buf.write_str("pony").unwrap();
        assert_eq!(buf.filled(), b"pony\0");

        buf.seek(0).unwrap();
        assert_eq!(buf.read_str().unwrap(), "pony");
        assert_eq!(buf.position(), 5);
    }

    #[test]
    fn empty_string_is_just_a_terminator() {
        let mut buf = StreamBuffer::new(4);
        buf.write_str("").unwrap();
        assert_eq!(buf.filled(), &[0]);

        buf.seek(0).unwrap();
        assert_eq!(buf.read_str().unwrap(), "");
    }

    #[test]
    fn unterminated_string_is_a_decode_error() {
        let mut buf = StreamBuffer::from_slice(b"no terminator here");
        let err = buf.read_str().unwrap_err();
        assert!(matches!(err, RanchwireError::Decode(_)));
    }

    #[test]
    fn string_write_is_atomic_at_capacity() {
        // 4 bytes of content need 5 bytes with the terminator.
        let mut buf = StreamBuffer::new(4);
        assert!(buf.write_str("pony").is_err());
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn lists_carry_a_single_length_byte() {
        let mut buf = StreamBuffer::new(16);
        buf.write_list(&[0x0102u16, 0x0304]).unwrap();
        assert_eq!(buf.filled(), &[2, 0x02, 0x01, 0x04, 0x03]);

        buf.seek(0).unwrap();
        let items: Vec<u16> = buf.read_list().unwrap();
        assert_eq!(items, vec![0x0102, 0x0304]);
    }

    #[test]
    fn list_over_255_elements_is_rejected() {
        let mut buf = StreamBuffer::new(512);
        let items = vec![0u8; 256];
        assert!(matches!(
            buf.write_list(&items),
            Err(RanchwireError::Protocol(_))
        ));
    }

    #[test]
    fn struct_payload_round_trip() {
        struct HorseRecord {
            uid: u32,
            grade: u8,
            name: String,
        }

        impl WireEncode for HorseRecord {
            fn encode(&self, buf: &mut StreamBuffer) -> Result<()> {
                buf.write_u32(self.uid)?;
                buf.write_u8(self.grade)?;
                buf.write_str(&self.name)
            }
        }

        impl WireDecode for HorseRecord {
            fn decode(buf: &mut StreamBuffer) -> Result<Self> {
                Ok(Self {
                    uid: buf.read_u32()?,
                    grade: buf.read_u8()?,
                    name: buf.read_str()?,
                })
            }
        }

        let mut buf = StreamBuffer::new(64);
        HorseRecord {
            uid: 9001,
            grade: 3,
            name: "Star".into(),
        }
        .encode(&mut buf)
        .unwrap();

        let mut parse = StreamBuffer::from_slice(buf.filled());
        let back = HorseRecord::decode(&mut parse).unwrap();
        assert_eq!(back.uid, 9001);
        assert_eq!(back.grade, 3);
        assert_eq!(back.name, "Star");
    }
}
