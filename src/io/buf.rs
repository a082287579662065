// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Chunked FIFO byte buffer used by the producer/consumer fabric.
//!
//! Internally a deque of [`Bytes`] chunks plus a start offset into the
//! head chunk. Appends are O(1); popping k bytes walks head chunks and
//! slices the tail chunk at most once. `pop_list` hands the chunks back
//! without joining them, which lets flows move data without copies.
//!
//! Each method is individually atomic under an internal mutex so a
//! buffer can be filled before it is handed to the reactor thread;
//! composite sequences are caller-sequenced.

use std::{collections::VecDeque, fmt};

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    chunks: VecDeque<Bytes>,
    /// Offset of the first unread byte in the head chunk.
    start: usize,
    len: usize,
}

#[derive(Default)]
pub struct ByteBuf {
    inner: Mutex<Inner>,
}

impl ByteBuf {
    pub fn new() -> Self {
        ByteBuf::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let buf = ByteBuf::new();
        buf.append(Bytes::copy_from_slice(data));
        buf
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a chunk to the buffer tail. O(1).
    pub fn append(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.len += chunk.len();
        inner.chunks.push_back(chunk);
    }

    pub fn append_slice(&self, data: &[u8]) {
        self.append(Bytes::copy_from_slice(data));
    }

    /// Appends a list of chunks, e.g. the result of [`ByteBuf::pop_list`].
    pub fn append_list(&self, chunks: Vec<Bytes>) {
        let mut inner = self.inner.lock();
        for chunk in chunks {
            if !chunk.is_empty() {
                inner.len += chunk.len();
                inner.chunks.push_back(chunk);
            }
        }
    }

    /// Pops up to `max` bytes as a list of chunks without joining them.
    ///
    /// Popping more than is available returns what is available.
    pub fn pop_list(&self, max: usize) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let mut left = max;
        while left > 0 {
            let Some(head) = inner.chunks.front() else {
                break;
            };
            let avail = head.len() - inner.start;
            if avail <= left {
                let start = inner.start;
                let head = inner.chunks.pop_front().expect("head chunk checked");
                out.push(head.slice(start..));
                inner.start = 0;
                inner.len -= avail;
                left -= avail;
            } else {
                let start = inner.start;
                out.push(
                    inner.chunks.front().expect("head chunk checked").slice(
                        start..start + left,
                    ),
                );
                inner.start += left;
                inner.len -= left;
                left = 0;
            }
        }
        out
    }

    /// Pops up to `max` bytes as one joined byte vector.
    pub fn pop(&self, max: usize) -> Vec<u8> {
        let chunks = self.pop_list(max);
        let mut out = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Pops the whole buffer content.
    pub fn pop_all(&self) -> Vec<u8> {
        let max = self.len();
        self.pop(max)
    }

    /// Copies out up to `max` bytes without advancing the read position.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(max.min(inner.len));
        let mut left = max;
        let mut start = inner.start;
        for chunk in &inner.chunks {
            if left == 0 {
                break;
            }
            let avail = chunk.len() - start;
            let take = avail.min(left);
            out.extend_from_slice(&chunk[start..start + take]);
            left -= take;
            start = 0;
        }
        out
    }

    pub fn peek_all(&self) -> Vec<u8> {
        let max = self.len();
        self.peek(max)
    }

    /// Discards up to `max` bytes without copying them out.
    pub fn remove(&self, max: usize) {
        let mut inner = self.inner.lock();
        let mut left = max;
        while left > 0 {
            let Some(head) = inner.chunks.front() else {
                break;
            };
            let avail = head.len() - inner.start;
            if avail <= left {
                inner.chunks.pop_front();
                inner.start = 0;
                inner.len -= avail;
                left -= avail;
            } else {
                inner.start += left;
                inner.len -= left;
                left = 0;
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.start = 0;
        inner.len = 0;
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ByteBuf")
            .field("len", &inner.len)
            .field("chunks", &inner.chunks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_crosses_chunk_boundaries() {
        let buf = ByteBuf::new();
        buf.append_slice(b"abc");
        buf.append_slice(b"defg");
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.pop(5), b"abcde".to_vec());
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.pop(10), b"fg".to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn peek_does_not_advance() {
        let buf = ByteBuf::new();
        buf.append_slice(b"hello");
        assert_eq!(buf.peek(3), b"hel".to_vec());
        assert_eq!(buf.pop(5), b"hello".to_vec());
    }

    #[test]
    fn remove_discards() {
        let buf = ByteBuf::new();
        buf.append_slice(b"0123456789");
        buf.remove(4);
        assert_eq!(buf.pop_all(), b"456789".to_vec());
    }
}
