//! Byte-level stream buffering: wrap-around `read`/`write` buffers over any
//! `Read`/`Write` source. Exposes exactly `read`, `write`, and `flush`, and
//! nothing else from the core.

use std::io::{self, Read, Write};

/// Default buffer size for both [`BufferedReader`] and [`BufferedWriter`].
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// A ring buffer that refills from `inner` on underrun and serves
/// `read_exact`-style reads out of whatever's buffered.
pub struct BufferedReader<S: Read> {
    inner: S,
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl<S: Read> BufferedReader<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn with_default_capacity(inner: S) -> Self {
        Self::new(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Pulls at least one more byte from `inner` into the buffer. The read
    /// is done into the single largest contiguous free run (immediately
    /// after the logical tail, wrapping at the buffer's end), so a
    /// maximally-wrapped buffer may take two refills to become completely
    /// full again; it never needs more than one syscall to make progress.
    fn refill(&mut self) -> io::Result<usize> {
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let free = cap - self.len;
        let contiguous = (cap - tail).min(free);
        let n = self.inner.read(&mut self.buf[tail..tail + contiguous])?;
        self.len += n;
        Ok(n)
    }

    fn take(&mut self, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let n = out.len().min(self.len);
        for (i, byte) in out.iter_mut().enumerate().take(n) {
            *byte = self.buf[(self.head + i) % cap];
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }

    /// Reads at least one byte, refilling from `inner` if the buffer is
    /// currently empty. Returns `Ok(0)` only at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.len == 0 {
            let n = self.refill()?;
            if n == 0 {
                return Ok(0);
            }
        }
        Ok(self.take(buf))
    }

    /// Fills `buf` completely, refilling from `inner` as many times as
    /// necessary. Errors with `UnexpectedEof` if the stream ends first.
    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended before buffer was filled"));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

/// A ring buffer that accumulates writes and flushes to `inner` when full
/// or on explicit [`flush`](Self::flush).
pub struct BufferedWriter<S: Write> {
    inner: S,
    buf: Vec<u8>,
    len: usize,
}

impl<S: Write> BufferedWriter<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0; capacity.max(1)],
            len: 0,
        }
    }

    pub fn with_default_capacity(inner: S) -> Self {
        Self::new(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn into_inner(mut self) -> S {
        let _ = self.flush();
        self.inner
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Appends as much of `data` as currently fits, flushing first if the
    /// buffer is full.
    fn append(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.len == self.capacity() {
            self.flush()?;
        }
        let n = data.len().min(self.capacity() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.len == 0 && buf.len() >= self.capacity() {
            // Bypass buffering entirely for writes at least as large as the
            // buffer itself.
            return self.inner.write(buf);
        }
        self.append(buf)
    }

    /// Writes the entire buffer, flushing as many times as necessary.
    pub fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Flushes any buffered bytes to `inner` and flushes `inner` itself.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.len > 0 {
            self.inner.write_all(&self.buf[..self.len])?;
            self.len = 0;
        }
        self.inner.flush()
    }
}

impl<S: Write> Drop for BufferedWriter<S> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_wraps_around() {
        // Tiny buffer forces several wrap-around refills.
        let data: Vec<u8> = (0u8..=255).collect();
        let mut reader = BufferedReader::new(std::io::Cursor::new(data.clone()), 8);
        let mut out = vec![0u8; data.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn writer_flushes_on_full_buffer() {
        let mut writer = BufferedWriter::new(Vec::new(), 4);
        writer.write_all(b"hello world").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), b"hello world");
    }

    #[test]
    fn read_exact_reports_short_stream() {
        let mut reader = BufferedReader::new(std::io::Cursor::new(vec![1, 2, 3]), 16);
        let mut out = [0u8; 4];
        let err = reader.read_exact(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
