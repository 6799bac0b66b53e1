// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Byte buffers for the proxy data path. `BufferChain` is an owned sequence
//! of byte segments with O(1) append, used for the read, write and delay
//! queues of a connection. Ownership of a chain (or a segment) always
//! transfers on hand-off; clones are explicit and deep.

pub use bytes::Buf;

use std::collections::VecDeque;

// The size of one kilobyte, in bytes
const KB: usize = 1024;

// The target size of read operations, the upper-bound on TLS fragment size
// as per RFC 5246:
// https://datatracker.ietf.org/doc/html/rfc5246#section-6.2.1
pub const TARGET_READ_SIZE: usize = 16 * KB;

/// An ordered sequence of owned byte segments with a total length. Appending
/// a segment or another chain is O(1); splitting copies the boundary segment.
#[derive(Clone, Default)]
pub struct BufferChain {
    segments: VecDeque<Vec<u8>>,
    head_offset: usize,
    length: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// A chain is contiguous when all of its bytes live in one segment.
    pub fn is_contiguous(&self) -> bool {
        self.segments.len() <= 1
    }

    /// Append an owned segment to the tail of the chain.
    pub fn append(&mut self, segment: Vec<u8>) {
        if segment.is_empty() {
            return;
        }
        self.length += segment.len();
        self.segments.push_back(segment);
    }

    /// Append another chain, transferring ownership of its segments.
    pub fn append_chain(&mut self, mut other: BufferChain) {
        other.normalize_head();
        self.length += other.length;
        self.segments.append(&mut other.segments);
    }

    /// Prepend an owned segment to the head of the chain.
    pub fn prepend(&mut self, segment: Vec<u8>) {
        if segment.is_empty() {
            return;
        }
        self.normalize_head();
        self.length += segment.len();
        self.segments.push_front(segment);
    }

    /// Prepend another chain, preserving its internal order.
    pub fn prepend_chain(&mut self, mut other: BufferChain) {
        other.normalize_head();
        std::mem::swap(self, &mut other);
        self.append_chain(other);
    }

    /// Copy bytes into the tail of the chain. Extends the last segment when
    /// one exists so that repeated small writes do not fragment the chain.
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.length += src.len();
        match self.segments.back_mut() {
            Some(tail) => tail.extend_from_slice(src),
            None => self.segments.push_back(src.to_vec()),
        }
    }

    /// Split the chain at `at`, returning the tail. The segment spanning the
    /// split point is copied; all other segments move without copying.
    pub fn split_off(&mut self, at: usize) -> BufferChain {
        assert!(at <= self.length);
        self.normalize_head();

        let mut tail = BufferChain::new();
        if at == self.length {
            return tail;
        }

        let mut consumed = 0;
        let mut boundary = None;
        for (i, seg) in self.segments.iter().enumerate() {
            if consumed + seg.len() > at {
                boundary = Some((i, at - consumed));
                break;
            }
            consumed += seg.len();
        }

        let (index, offset) = boundary.expect("split point within chain");

        // copy the boundary segment's tail, then move whole trailing segments
        if offset > 0 {
            let seg = &mut self.segments[index];
            tail.append(seg[offset..].to_vec());
            seg.truncate(offset);
            for seg in self.segments.drain(index + 1..) {
                tail.length += seg.len();
                tail.segments.push_back(seg);
            }
        } else {
            for seg in self.segments.drain(index..) {
                tail.length += seg.len();
                tail.segments.push_back(seg);
            }
        }

        self.length = at;
        tail
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`. Returns
    /// the number of bytes copied.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.length || dst.is_empty() {
            return 0;
        }

        let mut position = 0;
        let mut copied = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            let seg = if i == 0 { &seg[self.head_offset..] } else { &seg[..] };
            let seg_end = position + seg.len();
            if seg_end > offset {
                let start = offset.saturating_sub(position);
                let avail = &seg[start..];
                let n = std::cmp::min(avail.len(), dst.len() - copied);
                dst[copied..copied + n].copy_from_slice(&avail[..n]);
                copied += n;
                if copied == dst.len() {
                    break;
                }
            }
            position = seg_end;
        }
        copied
    }

    /// Coalesce the chain into a single segment and return a view of it.
    pub fn make_contiguous(&mut self) -> &[u8] {
        self.normalize_head();
        if self.segments.len() > 1 {
            let mut flat = Vec::with_capacity(self.length);
            for seg in self.segments.drain(..) {
                flat.extend_from_slice(&seg);
            }
            self.segments.push_back(flat);
        }
        self.segments.front().map(|s| &s[..]).unwrap_or(&[])
    }

    /// Take the entire chain, leaving this one empty.
    pub fn take_all(&mut self) -> BufferChain {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.head_offset = 0;
        self.length = 0;
    }

    // Rewrites the head segment so that consumed bytes are gone and
    // head_offset is zero. Needed before structural edits at the head.
    fn normalize_head(&mut self) {
        if self.head_offset > 0 {
            if let Some(head) = self.segments.front_mut() {
                *head = head[self.head_offset..].to_vec();
            }
            self.head_offset = 0;
        }
    }
}

impl Buf for BufferChain {
    fn remaining(&self) -> usize {
        self.length
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.front() {
            Some(seg) => &seg[self.head_offset..],
            None => &[],
        }
    }

    fn advance(&mut self, mut amt: usize) {
        assert!(amt <= self.length);
        self.length -= amt;
        while amt > 0 {
            let head_len = self.segments.front().map(|s| s.len()).unwrap_or(0);
            let available = head_len - self.head_offset;
            if amt < available {
                self.head_offset += amt;
                return;
            }
            amt -= available;
            self.segments.pop_front();
            self.head_offset = 0;
        }
    }
}

impl From<Vec<u8>> for BufferChain {
    fn from(segment: Vec<u8>) -> Self {
        let mut chain = BufferChain::new();
        chain.append(segment);
        chain
    }
}

impl From<&[u8]> for BufferChain {
    fn from(src: &[u8]) -> Self {
        BufferChain::from(src.to_vec())
    }
}

impl std::fmt::Debug for BufferChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferChain {{ len: {}, segments: {} }}",
            self.length,
            self.segments.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_bytes(chain: &BufferChain) -> Vec<u8> {
        let mut out = vec![0; chain.len()];
        let copied = chain.copy_out(0, &mut out);
        assert_eq!(copied, chain.len());
        out
    }

    #[test]
    fn append_and_length() {
        let mut chain = BufferChain::new();
        assert!(chain.is_empty());
        chain.append(b"hello".to_vec());
        chain.append(b" world".to_vec());
        assert_eq!(chain.len(), 11);
        assert!(!chain.is_contiguous());
        assert_eq!(chain_bytes(&chain), b"hello world");
    }

    #[test]
    fn split_then_concat_roundtrip() {
        let mut chain = BufferChain::new();
        chain.append(b"abcde".to_vec());
        chain.append(b"fghij".to_vec());
        chain.append(b"klmno".to_vec());

        for at in [0, 3, 5, 7, 12, 15] {
            let mut left = chain.clone();
            let right = left.split_off(at);
            assert_eq!(left.len(), at);
            assert_eq!(right.len(), 15 - at);
            left.append_chain(right);
            assert_eq!(chain_bytes(&left), b"abcdefghijklmno");
        }
    }

    #[test]
    fn advance_across_segments() {
        let mut chain = BufferChain::new();
        chain.append(b"abc".to_vec());
        chain.append(b"defg".to_vec());

        chain.advance(2);
        assert_eq!(chain.chunk(), b"c");
        chain.advance(2);
        assert_eq!(chain.chunk(), b"efg");
        chain.advance(3);
        assert!(chain.is_empty());
        assert_eq!(chain.chunk(), b"");
    }

    #[test]
    fn prepend_after_partial_consume() {
        let mut chain = BufferChain::new();
        chain.append(b"header-body".to_vec());
        chain.advance(7);
        chain.prepend(b"new-".to_vec());
        assert_eq!(chain_bytes(&chain), b"new-body");
    }

    #[test]
    fn copy_out_with_offset() {
        let mut chain = BufferChain::new();
        chain.append(b"0123".to_vec());
        chain.append(b"4567".to_vec());

        let mut dst = [0; 3];
        assert_eq!(chain.copy_out(3, &mut dst), 3);
        assert_eq!(&dst, b"345");

        let mut dst = [0; 16];
        assert_eq!(chain.copy_out(6, &mut dst), 2);
        assert_eq!(&dst[..2], b"67");

        assert_eq!(chain.copy_out(8, &mut dst), 0);
    }

    #[test]
    fn make_contiguous_coalesces() {
        let mut chain = BufferChain::new();
        chain.append(b"ab".to_vec());
        chain.append(b"cd".to_vec());
        assert!(!chain.is_contiguous());
        assert_eq!(chain.make_contiguous(), b"abcd");
        assert!(chain.is_contiguous());
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn clone_is_deep() {
        let mut chain = BufferChain::new();
        chain.append(b"data".to_vec());
        let copy = chain.clone();
        chain.advance(4);
        assert!(chain.is_empty());
        assert_eq!(chain_bytes(&copy), b"data");
    }

    #[test]
    fn extend_reuses_tail_segment() {
        let mut chain = BufferChain::new();
        chain.extend_from_slice(b"ab");
        chain.extend_from_slice(b"cd");
        assert!(chain.is_contiguous());
        assert_eq!(chain_bytes(&chain), b"abcd");
    }

}
