// Copyright 2024 The vev developers
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

//! Growable byte buffer with read/write cursors.
//!
//! The region between the cursors holds unread data; the space before the
//! read cursor is reclaimed by compaction before the buffer is grown. A
//! socket read lands in the writable tail and spills into a stack buffer so
//! a single syscall can pull in more than the current capacity.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

const INITIAL_CAPACITY: usize = 1024;

/// Size of the stack-side spill buffer used by [`Buffer::read_from`].
const SPILL_SIZE: usize = 64 * 1024;

/// A contiguous byte region with advancing read and write cursors.
///
/// Invariant: `read_pos <= write_pos <= capacity`.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_CAPACITY)
    }
}

impl Buffer {
    /// Creates a buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to write without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Bytes already consumed in front of the read cursor.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Advances the read cursor by `len` bytes.
    ///
    /// # Panics
    /// Panics if `len` exceeds the readable region.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.read_pos += len;
    }

    /// Advances the read cursor to `end`, an offset into the readable region.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Resets both cursors, discarding any unread data.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Takes the readable bytes as a string and resets the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Appends `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Marks `len` bytes past the write cursor as written.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    /// Guarantees room for `len` writable bytes, compacting the consumed
    /// prefix when that suffices and growing the region otherwise.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
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

    /// Scatter-reads from `r` into the writable tail plus a stack spill
    /// buffer, then appends whatever overflowed. One syscall per call.
    ///
    /// `Ok(0)` means end of stream. `WouldBlock` is returned unchanged for
    /// the caller's drain loop to interpret.
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_bytes();
        let write_pos = self.write_pos;
        let n = {
            let (tail, spill) = (&mut self.buf[write_pos..], &mut spill[..]);
            let mut iovs = [IoSliceMut::new(tail), IoSliceMut::new(spill)];
            r.read_vectored(&mut iovs)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Drains the readable region into `w` with a single syscall, advancing
    /// the read cursor by however much was accepted.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let n = w.write(self.peek())?;
        self.read_pos += n;
        Ok(n)
    }

    /// The readable region as an [`IoSlice`] for gather writes.
    pub fn as_io_slice(&self) -> IoSlice<'_> {
        IoSlice::new(self.peek())
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;
    use std::io::{self, IoSliceMut, Read};

    fn invariants(b: &Buffer) {
        assert!(b.read_pos <= b.write_pos);
        assert!(b.write_pos <= b.buf.len());
        assert_eq!(
            b.readable_bytes() + b.writable_bytes() + b.prependable_bytes(),
            b.buf.len()
        );
    }

    #[test]
    fn append_extends_readable_region() {
        let mut b = Buffer::default();
        b.append(b"hello");
        b.append(b" world");
        assert_eq!(11, b.readable_bytes());
        assert_eq!(b"hello world", b.peek());
        invariants(&b);
    }

    #[test]
    fn retrieve_advances_and_retrieve_all_resets() {
        let mut b = Buffer::default();
        b.append(b"abcdef");
        b.retrieve(2);
        assert_eq!(b"cdef", b.peek());
        assert_eq!(2, b.prependable_bytes());
        b.retrieve_all();
        assert_eq!(0, b.readable_bytes());
        assert_eq!(0, b.prependable_bytes());
        invariants(&b);
    }

    #[test]
    fn retrieve_until_advances_past_a_line_boundary() {
        let mut b = Buffer::default();
        b.append(b"GET / HTTP/1.1\r\nrest");
        let end = b.peek().windows(2).position(|w| w == b"\r\n").unwrap() + 2;
        b.retrieve_until(end);
        assert_eq!(b"rest", b.peek());
        invariants(&b);
    }

    #[test]
    fn retrieve_all_to_string_round_trips() {
        let mut b = Buffer::default();
        b.append(b"GET / HTTP/1.1");
        assert_eq!("GET / HTTP/1.1", b.retrieve_all_to_string());
        assert_eq!(0, b.readable_bytes());
    }

    #[test]
    fn append_beyond_capacity_grows() {
        let mut b = Buffer::new(8);
        b.append(&[b'x'; 100]);
        assert_eq!(100, b.readable_bytes());
        invariants(&b);
    }

    #[test]
    fn consumed_prefix_is_compacted_before_growing() {
        let mut b = Buffer::new(16);
        b.append(&[b'a'; 12]);
        b.retrieve(10);
        // 2 readable, 4 writable, 10 prependable: room for 8 via compaction.
        let cap_before = b.buf.len();
        b.append(&[b'b'; 8]);
        assert_eq!(cap_before, b.buf.len());
        assert_eq!(b"aabbbbbbbb", b.peek());
        invariants(&b);
    }

    /// Reader that fills every provided slice, exercising the spill path.
    struct Flood(usize);

    impl Read for Flood {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.0.min(buf.len());
            buf[..n].fill(b'z');
            self.0 -= n;
            Ok(n)
        }

        fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let mut total = 0;
            for b in bufs {
                let n = self.0.min(b.len());
                b[..n].fill(b'z');
                self.0 -= n;
                total += n;
            }
            Ok(total)
        }
    }

    #[test]
    fn scatter_read_overflow_lands_in_buffer() {
        let mut b = Buffer::default();
        let n = b.read_from(&mut Flood(4096)).unwrap();
        assert_eq!(4096, n);
        assert_eq!(4096, b.readable_bytes());
        assert!(b.peek().iter().all(|&c| c == b'z'));
        invariants(&b);
    }

    #[test]
    fn write_to_drains_readable_region() {
        let mut b = Buffer::default();
        b.append(b"response bytes");
        let mut out = Vec::new();
        let n = b.write_to(&mut out).unwrap();
        assert_eq!(14, n);
        assert_eq!(b"response bytes", out.as_slice());
        assert_eq!(0, b.readable_bytes());
    }
}
