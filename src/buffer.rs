// Copyright 2026 the vakt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable byte buffer with separate read and write cursors.
//!
//! One instance backs each connection's receive side and another its send
//! side. Growth is geometric and bounded by a per-call ceiling so a single
//! connection cannot balloon the process.

use std::io::{ErrorKind, Read, Result, Write};

const READ_CHUNK: usize = 4 * 1024;

/// A contiguous byte buffer that tracks how much of its content has been
/// consumed. Consumed space is reclaimed by compaction rather than by
/// shifting on every read.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl Buffer {
    /// Creates an empty buffer that will allocate on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer with `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_offset: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_offset
    }

    /// True when every written byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unconsumed portion of the buffer.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_offset..]
    }

    /// Appends `bytes` at the write cursor.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `amount` bytes as consumed. Compacts once the whole buffer has
    /// been read, or when the dead prefix outgrows the live remainder.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.data.len().min(self.read_offset + amount);
        self.compact();
    }

    /// Drops all content and releases excess capacity beyond `keep`.
    pub fn reset(&mut self, keep: usize) {
        self.data.clear();
        self.read_offset = 0;
        self.data.shrink_to(keep);
    }

    fn compact(&mut self) {
        if self.read_offset == self.data.len() {
            self.data.clear();
            self.read_offset = 0;
        } else if self.read_offset > READ_CHUNK && self.read_offset > self.remaining() {
            self.data.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Fills the buffer from `source` until it would block, hits EOF, or the
    /// buffer reaches `ceiling` bytes of unread content.
    ///
    /// Returns `Ok(0)` only on EOF. `WouldBlock` with data already read is
    /// reported as the byte count; with nothing read it surfaces as an error
    /// so the caller can distinguish a spurious wakeup.
    pub fn fill_from<R: Read>(&mut self, source: &mut R, ceiling: usize) -> Result<usize> {
        let mut read = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if self.remaining() >= ceiling {
                return Ok(read);
            }
            let want = READ_CHUNK.min(ceiling - self.remaining());

            match source.read(&mut chunk[..want]) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    read += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        if read == 0 {
                            return Err(e);
                        }
                        return Ok(read);
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }
    }

    /// Drains as much unconsumed content as possible into `sink` without
    /// blocking. Returns the number of bytes written; the rest stays queued.
    pub fn drain_into<W: Write>(&mut self, sink: &mut W) -> Result<usize> {
        let mut flushed = 0;

        while self.remaining() > 0 {
            match sink.write(self.unread()) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.mark_read(n);
                    flushed += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }

        Ok(flushed)
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;
    use std::io::Cursor;

    #[test]
    fn extend_and_mark_read_track_remaining() {
        let mut buf = Buffer::new();
        buf.extend(b"hello world");
        assert_eq!(11, buf.remaining());

        buf.mark_read(6);
        assert_eq!(5, buf.remaining());
        assert_eq!(b"world", buf.unread());

        buf.mark_read(5);
        assert!(buf.is_empty());
        assert_eq!(0, buf.unread().len());
    }

    #[test]
    fn mark_read_past_end_saturates() {
        let mut buf = Buffer::new();
        buf.extend(b"abc");
        buf.mark_read(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn fill_from_respects_ceiling() {
        let mut buf = Buffer::new();
        let data = vec![0xaau8; 64 * 1024];
        let mut src = Cursor::new(data);

        buf.fill_from(&mut src, 1024).unwrap();
        assert_eq!(1024, buf.remaining());

        // another call makes no progress while at the ceiling
        let n = buf.fill_from(&mut src, 1024).unwrap();
        assert_eq!(0, n);
        assert_eq!(1024, buf.remaining());
    }

    #[test]
    fn drain_into_writes_everything_to_unbounded_sink() {
        let mut buf = Buffer::new();
        buf.extend(b"response bytes");
        let mut out = Vec::new();
        let n = buf.drain_into(&mut out).unwrap();
        assert_eq!(14, n);
        assert_eq!(b"response bytes", out.as_slice());
        assert!(buf.is_empty());
    }

    #[test]
    fn compaction_preserves_unread_tail() {
        let mut buf = Buffer::new();
        buf.extend(&vec![b'x'; 8192]);
        buf.mark_read(8000);
        buf.extend(b"tail");
        assert_eq!(192 + 4, buf.remaining());
        assert_eq!(b"tail", &buf.unread()[192..]);
    }
}
