use std::io::{self, IoSlice, Write};

use crate::buffer::Buffer;

/// Tracks how far a response has been sent: the header region is consumed
/// from its [`Buffer`], the file body by an offset into the mapping.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    file_offset: usize,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.file_offset = 0;
    }

    pub fn file_offset(&self) -> usize {
        self.file_offset
    }

    /// Bytes of `head` and `file` not yet accepted by the peer.
    pub fn remaining(&self, head: &Buffer, file: &[u8]) -> usize {
        head.readable_bytes() + file.len().saturating_sub(self.file_offset)
    }

    /// Issues a single write. With no body left only the header region is
    /// written; otherwise both regions go out in one vectored write.
    pub fn write_once<W: Write>(&mut self, dst: &mut W, head: &mut Buffer, file: &[u8]) -> io::Result<usize> {
        let body = &file[self.file_offset.min(file.len())..];
        if body.is_empty() {
            return head.write_to(dst);
        }

        let n = dst.write_vectored(&[IoSlice::new(head.peek()), IoSlice::new(body)])?;

        let pending_head = head.readable_bytes();
        if n >= pending_head {
            head.retrieve_all();
            self.file_offset += n - pending_head;
        } else {
            head.retrieve(n);
        }
        Ok(n)
    }
}
