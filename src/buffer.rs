//! Growable byte buffer with independent read and write cursors.
//!
//! The storage is split into three regions:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |    (CONTENT)     |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_pos     <=     write_pos    <=     capacity
//! ```
//!
//! Every socket read and every serialized response is staged here. A buffer
//! is owned by exactly one [`HttpConn`](crate::http::connection::HttpConn),
//! which moves between the poll thread and a worker, so the reader and writer
//! roles never race.

use std::io::{self, IoSliceMut, Read, Write};

use bytes::Buf;

/// Size of the stack region used to absorb reads larger than the writable tail.
const EXTRA_READ: usize = 65535;

const INITIAL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new(init_size: usize) -> Self {
        Self {
            buf: vec![0; init_size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Offset of `needle` inside the readable region.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.peek().windows(needle.len()).position(|w| w == needle)
    }

    /// Guarantees at least `len` writable bytes, compacting or growing storage.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Marks `len` bytes of the writable region as filled.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`writable_bytes`](Self::writable_bytes).
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes(), "has_written past capacity");
        self.write_pos += len;
    }

    /// The writable region, to be filled and then committed with
    /// [`has_written`](Self::has_written).
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Consumes up to `len` readable bytes. Never moves past the write cursor.
    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_bytes());
        self.read_pos += len;
    }

    /// Consumes the readable bytes before offset `end` (relative to [`peek`](Self::peek)).
    pub fn retrieve_until(&mut self, end: usize) {
        debug_assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    /// Reads from `src` with a single scatter read over the writable tail and
    /// a 64 KiB stack extension, so one call can take in more than the buffer
    /// currently has room for. Returns the number of bytes read.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_pos);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            src.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region once and consumes what was accepted.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = dst.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.peek()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.readable_bytes(), "advance past readable bytes");
        self.retrieve(cnt);
    }
}
