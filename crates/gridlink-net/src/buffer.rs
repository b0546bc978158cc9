//! Buffered octet streams layered on a raw stream.
//!
//! Both directions minimise the number of calls into the underlying stream
//! first and the number of copies second: requests at least as large as the
//! internal buffer bypass it entirely.

use std::io::{self, Read, Write};

/// Default buffer capacity for both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Buffering reader with a fixed internal buffer, a read cursor and a
/// valid-length marker.
pub struct BufferedInput<R> {
    inner: R,
    buf: Vec<u8>,
    /// Next unread offset in `buf`.
    next: usize,
    /// Valid octets in `buf`.
    valid: usize,
}

impl<R: Read> BufferedInput<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self { inner, buf: vec![0; capacity.max(1)], next: 0, valid: 0 }
    }

    /// Octets buffered but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.valid - self.next
    }

    /// Refills the buffer if it is empty, returning the octets available.
    /// On a refill error the cursor and valid-length are left describing an
    /// empty buffer; octets the failed read may have moved are dropped.
    fn fill_buffer(&mut self) -> io::Result<usize> {
        let available = self.buffered();
        if available > 0 {
            return Ok(available);
        }
        self.next = 0;
        self.valid = 0;
        let read = self.inner.read(&mut self.buf)?;
        self.valid = read;
        Ok(read)
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        if self.next == self.valid && self.fill_buffer()? == 0 {
            // nothing buffered and nothing pending; block on the stream
            let mut b = [0u8; 1];
            if self.inner.read(&mut b)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(b[0]);
        }
        let b = self.buf[self.next];
        self.next += 1;
        Ok(b)
    }

    /// Fills `out` completely, erroring with `UnexpectedEof` if the stream
    /// ends first.
    pub fn read_fully(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut total = 0;
        while total < out.len() {
            match self.read_internal(&mut out[total..])? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => total += n,
            }
        }
        Ok(())
    }

    fn read_internal(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;

        // drain the buffer first
        let available = self.buffered();
        if available > 0 {
            total = available.min(out.len());
            out[..total].copy_from_slice(&self.buf[self.next..self.next + total]);
            self.next += total;
            if total == out.len() {
                return Ok(total);
            }
        }

        // buffer is empty; a request at least as large as the buffer reads
        // straight through to skip the copy
        while out.len() - total >= self.buf.len() {
            match self.inner.read(&mut out[total..])? {
                0 => return Ok(total),
                n => total += n,
            }
            if total == out.len() {
                return Ok(total);
            }
        }

        // refill once and serve what arrived
        let available = self.fill_buffer()?;
        if available > 0 {
            let take = available.min(out.len() - total);
            out[total..total + take].copy_from_slice(&self.buf[self.next..self.next + take]);
            self.next += take;
            total += take;
        }

        Ok(total)
    }
}

impl<R: Read> Read for BufferedInput<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.read_internal(out)
    }
}

/// Buffering writer mirroring [`BufferedInput`].
pub struct BufferedOutput<W> {
    inner: W,
    buf: Vec<u8>,
    used: usize,
}

impl<W: Write> BufferedOutput<W> {
    pub fn new(inner: W) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        Self { inner, buf: vec![0; capacity.max(1)], used: 0 }
    }

    pub fn write_u8(&mut self, b: u8) -> io::Result<()> {
        if self.used == self.buf.len() {
            self.flush_buffer()?;
        }
        self.buf[self.used] = b;
        self.used += 1;
        Ok(())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.used > 0 {
            let used = self.used;
            self.inner.write_all(&self.buf[..used])?;
            self.used = 0;
        }
        Ok(())
    }

    fn write_internal(&mut self, data: &[u8]) -> io::Result<()> {
        let capacity = self.buf.len();
        let free = capacity - self.used;

        // minimise calls into the stream first, copies second
        if data.len() < free {
            // fits alongside what is already buffered
            self.buf[self.used..self.used + data.len()].copy_from_slice(data);
            self.used += data.len();
        } else if self.used == 0 {
            // nothing buffered and it does not fit; straight write
            self.inner.write_all(data)?;
        } else if data.len() < free + capacity {
            // one write suffices: fill, flush the whole buffer, re-buffer
            self.buf[self.used..].copy_from_slice(&data[..free]);
            self.inner.write_all(&self.buf)?;
            let rest = data.len() - free;
            self.buf[..rest].copy_from_slice(&data[free..]);
            self.used = rest;
        } else {
            // two writes either way; skip the needless copy into the buffer
            self.flush_buffer()?;
            self.inner.write_all(data)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for BufferedOutput<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_internal(data)?;
        Ok(data.len())
    }

    /// Forces the buffer through and flushes the underlying stream.
    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out its data in fixed-size chunks and can be
    /// primed to fail.
    struct ChunkReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        fail_next: bool,
    }

    impl ChunkReader {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self { data, pos: 0, chunk, fail_next: false }
        }
    }

    impl Read for ChunkReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.fail_next {
                self.fail_next = false;
                return Err(io::Error::other("primed failure"));
            }
            let n = out.len().min(self.chunk).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn drains_buffer_before_refilling() {
        let data: Vec<u8> = (0..100).collect();
        let mut input = BufferedInput::with_capacity(ChunkReader::new(data.clone(), 64), 16);
        let mut out = vec![0u8; 100];
        input.read_fully(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn large_requests_bypass_the_buffer() {
        let data: Vec<u8> = (0..=255).collect();
        let mut input = BufferedInput::with_capacity(ChunkReader::new(data.clone(), 256), 8);
        assert_eq!(input.read_u8().unwrap(), 0);
        // 7 octets now buffered; the rest of the request reads through
        let mut out = vec![0u8; 255];
        input.read_fully(&mut out).unwrap();
        assert_eq!(out, &data[1..]);
        assert_eq!(input.buffered(), 0);
    }

    #[test]
    fn read_fully_past_end_is_eof() {
        let mut input = BufferedInput::with_capacity(ChunkReader::new(vec![1, 2, 3], 4), 8);
        let mut out = vec![0u8; 4];
        let err = input.read_fully(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn failed_refill_leaves_buffer_consistent() {
        let mut reader = ChunkReader::new((0..32).collect(), 32);
        reader.fail_next = true;
        let mut input = BufferedInput::with_capacity(reader, 8);
        assert!(input.read_u8().is_err());
        assert_eq!(input.buffered(), 0);
        // the stream recovers and so must the buffer
        assert_eq!(input.read_u8().unwrap(), 0);
    }

    /// Writer recording each call so the flush/copy strategy is observable.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<Vec<u8>>,
        flushes: usize,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.writes.push(data.to_vec());
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn small_writes_coalesce_until_flush() {
        let mut out = BufferedOutput::with_capacity(RecordingWriter::default(), 16);
        out.write_all(&[1, 2, 3]).unwrap();
        out.write_all(&[4, 5]).unwrap();
        assert!(out.inner.writes.is_empty());
        out.flush().unwrap();
        assert_eq!(out.inner.writes, vec![vec![1, 2, 3, 4, 5]]);
        assert_eq!(out.inner.flushes, 1);
    }

    #[test]
    fn unbuffered_large_write_goes_straight_through() {
        let mut out = BufferedOutput::with_capacity(RecordingWriter::default(), 4);
        out.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(out.inner.writes, vec![vec![1, 2, 3, 4, 5, 6]]);
    }

    #[test]
    fn medium_write_fills_and_flushes_once() {
        let mut out = BufferedOutput::with_capacity(RecordingWriter::default(), 4);
        out.write_all(&[1, 2]).unwrap();
        out.write_all(&[3, 4, 5]).unwrap();
        // fill to [1,2,3,4], flush, keep [5] buffered
        assert_eq!(out.inner.writes, vec![vec![1, 2, 3, 4]]);
        assert_eq!(out.used, 1);
    }

    #[test]
    fn oversize_write_flushes_then_writes() {
        let mut out = BufferedOutput::with_capacity(RecordingWriter::default(), 4);
        out.write_all(&[1]).unwrap();
        out.write_all(&[2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(out.inner.writes, vec![vec![1], vec![2, 3, 4, 5, 6, 7, 8, 9]]);
    }
}
