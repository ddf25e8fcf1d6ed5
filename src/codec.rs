//! Typed framed-value codec: fixed-width primitives, a base-128 varint
//! length prefix, and length-prefixed byte strings (§4.11).
//!
//! This is the crate's one "external collaborator, specified only by
//! interface" per SPEC_FULL.md §1: it depends on nothing from the core
//! beyond [`crate::stream`]'s `read`/`write`/`flush` surface, never the
//! reverse. Fixed-width primitives are written little-endian on the wire,
//! an explicit resolution of a host-byte-order ambiguity; see DESIGN.md.

use crate::error::CodecError;
use crate::stream::{BufferedReader, BufferedWriter};
use std::io::{Read, Write};

type Result<T> = std::result::Result<T, CodecError>;

/// Reads fixed-width primitives and framed values off a buffered stream.
pub struct DataReader<'a, S: Read> {
    inner: &'a mut BufferedReader<S>,
}

impl<'a, S: Read> DataReader<'a, S> {
    pub fn new(inner: &'a mut BufferedReader<S>) -> Self {
        Self { inner }
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_bytes()?))
    }

    /// Reads a base-128 varint length prefix: low 7 bits per byte, high bit
    /// set means "more bytes follow", at most 5 bytes for a 32-bit value.
    pub fn read_length(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.read_u8()?;
            let payload = (byte & 0x7f) as u32;
            if i == 4 && (payload & !0x0f) != 0 {
                return Err(CodecError::LengthPrefixTooLong);
            }
            value |= payload << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::LengthPrefixTooLong)
    }

    /// Reads a length-prefixed raw byte string (no terminator).
    pub fn read_bytes_framed(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_bytes_framed()?)?)
    }
}

/// Writes fixed-width primitives and framed values onto a buffered stream.
pub struct DataWriter<'a, S: Write> {
    inner: &'a mut BufferedWriter<S>,
}

impl<'a, S: Write> DataWriter<'a, S> {
    pub fn new(inner: &'a mut BufferedWriter<S>) -> Self {
        Self { inner }
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_all(&[v])?;
        Ok(())
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// Writes `value` as a base-128 varint: 7 payload bits per byte, high
    /// bit set on every byte but the last. At most 5 bytes for a 32-bit
    /// value.
    pub fn write_length(&mut self, mut value: u32) -> Result<()> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    /// Writes a length prefix followed by the raw bytes, no terminator.
    pub fn write_bytes_framed(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_length(bytes.len() as u32)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_bytes_framed(s.as_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BufferedReader, BufferedWriter};

    #[test]
    fn fixed_width_round_trip() {
        let mut buf = BufferedWriter::new(Vec::new(), 16);
        let mut w = DataWriter::new(&mut buf);
        w.write_u8(0xab).unwrap();
        w.write_i16(-1234).unwrap();
        w.write_u32(0xdead_beef).unwrap();
        w.write_f64(std::f64::consts::PI).unwrap();
        w.flush().unwrap();
        let bytes = buf.into_inner();

        let cursor = std::io::Cursor::new(bytes);
        let mut reader = BufferedReader::new(cursor, 16);
        let mut r = DataReader::new(&mut reader);
        assert_eq!(r.read_u8().unwrap(), 0xab);
        assert_eq!(r.read_i16().unwrap(), -1234);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_f64().unwrap(), std::f64::consts::PI);
    }

    #[test]
    fn length_prefix_round_trip() {
        for n in [0u32, 1, 127, 128, 16384, u32::MAX] {
            let mut buf = BufferedWriter::new(Vec::new(), 16);
            let mut w = DataWriter::new(&mut buf);
            w.write_length(n).unwrap();
            w.flush().unwrap();
            let bytes = buf.into_inner();
            assert!(bytes.len() <= 5);

            let cursor = std::io::Cursor::new(bytes);
            let mut reader = BufferedReader::new(cursor, 16);
            let mut r = DataReader::new(&mut reader);
            assert_eq!(r.read_length().unwrap(), n);
        }
    }

    #[test]
    fn string_round_trip() {
        let s = "hello, fibers";
        let mut buf = BufferedWriter::new(Vec::new(), 64);
        let mut w = DataWriter::new(&mut buf);
        w.write_string(s).unwrap();
        w.flush().unwrap();
        let bytes = buf.into_inner();

        let cursor = std::io::Cursor::new(bytes);
        let mut reader = BufferedReader::new(cursor, 64);
        let mut r = DataReader::new(&mut reader);
        assert_eq!(r.read_string().unwrap(), s);
    }
}
