//! Pooled byte segments and segment chains.
//!
//! A chain has single ownership and is only ever appended to at the tail and
//! released from the head, so rather than a doubly-linked list we keep a flat
//! `Vec<Segment>` with a tail index: no back-pointers, no cycles to break on
//! release (see DESIGN.md).

use bytes::BytesMut;
use std::sync::{Mutex, OnceLock};

use crate::frame::{DEFAULT_SEGMENT_SIZE, HEADER_RESERVE};

/// A rented byte block plus a write cursor.
pub struct Segment {
    block: BytesMut,
    position: usize,
}

impl Segment {
    fn new(block: BytesMut) -> Self {
        Self { block, position: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.position
    }

    /// The unwritten tail of the block: `memory[position..]`.
    pub fn available_mut(&mut self) -> &mut [u8] {
        &mut self.block[self.position..]
    }

    /// The written prefix of the block: `memory[..position]`.
    pub fn written(&self) -> &[u8] {
        &self.block[..self.position]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.block[..]
    }

    /// Moves the write cursor forward by `n`. Panics if that would run past
    /// capacity — a programming error in the caller, never triggered by peer data.
    pub fn advance(&mut self, n: usize) {
        assert!(self.position + n <= self.capacity(), "segment advance past capacity");
        self.position += n;
    }

    /// Moves the write cursor backward by `n`, for stripping a trailer
    /// already written. Panics if that would run past the start.
    pub fn rewind(&mut self, n: usize) {
        assert!(n <= self.position, "segment rewind past start");
        self.position -= n;
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// The written region starting at `start`, for masking payload bytes
    /// without touching a reserved header prefix before them.
    pub fn written_mut_from(&mut self, start: usize) -> &mut [u8] {
        &mut self.block[start..self.position]
    }

    /// Mutable access to this segment's first `HEADER_RESERVE` bytes, for
    /// writing a frame header backward once the payload length is known.
    /// Segments are always rented at least `HEADER_RESERVE` bytes long.
    pub fn header_prefix_mut(&mut self) -> &mut [u8; HEADER_RESERVE] {
        (&mut self.block[..HEADER_RESERVE]).try_into().expect("segment shorter than HEADER_RESERVE")
    }
}

/// Process-wide pool of reusable byte blocks, sized for the 8192-byte default
/// segment plus the 14-byte header reserve.
pub struct SegmentPool {
    free: Mutex<Vec<BytesMut>>,
}

impl SegmentPool {
    fn new() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }

    /// A private pool instance, isolated from the process-wide singleton.
    /// Used by other modules' test suites that need a pool without touching
    /// `global()`'s shared state.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new()
    }

    /// The process-wide singleton pool: buffer pool rentals are shared-process
    /// singletons.
    pub fn global() -> &'static SegmentPool {
        static POOL: OnceLock<SegmentPool> = OnceLock::new();
        POOL.get_or_init(SegmentPool::new)
    }

    /// Rents a block sized for at least `min_size` bytes. Rented blocks may be
    /// larger than requested; the default floor is `DEFAULT_SEGMENT_SIZE`.
    pub fn rent(&self, min_size: usize) -> Segment {
        let wanted = min_size.max(DEFAULT_SEGMENT_SIZE);
        let mut free = self.free.lock().unwrap();
        while let Some(block) = free.pop() {
            if block.len() >= wanted {
                return Segment::new(block);
            }
            // Too small for this request; drop it rather than growing in place —
            // pooled blocks are reused whole, never resized.
        }
        drop(free);
        let mut block = BytesMut::zeroed(wanted);
        block.resize(wanted, 0);
        Segment::new(block)
    }

    /// A rent sized for a user hint that will carry a frame header too
    /// (`max(8192, hint + 14)`).
    pub fn rent_for_hint(&self, hint: usize) -> Segment {
        self.rent((hint + HEADER_RESERVE).max(DEFAULT_SEGMENT_SIZE))
    }

    fn release_one(&self, segment: Segment) {
        self.free.lock().unwrap().push(segment.block);
    }
}

/// A singly linked (forward-only) sequence of pooled segments forming one
/// logical byte sequence, with exclusive ownership by whichever buffer holds it.
pub struct SegmentChain {
    segments: Vec<Segment>,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Transfers ownership of `segment` to the chain's tail.
    pub fn append(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn tail_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut()
    }

    pub fn first_mut(&mut self) -> Option<&mut Segment> {
        self.segments.first_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Segment> {
        self.segments.iter_mut()
    }

    pub fn pop_tail(&mut self) -> Option<Segment> {
        self.segments.pop()
    }

    /// Total bytes written across all segments.
    pub fn total_written(&self) -> usize {
        self.segments.iter().map(Segment::position).sum()
    }

    /// Ensures the tail segment has room for at least one more byte, renting
    /// a fresh one sized for `hint` if the chain is empty or the current
    /// tail is full. `reserve_header` advances a brand-new first segment
    /// past `HEADER_RESERVE` before any payload lands in it, so the frame
    /// header can be written into that prefix once the payload is known.
    pub fn ensure_tail(&mut self, pool: &SegmentPool, hint: usize, reserve_header: bool) -> &mut Segment {
        let needs_new = match self.segments.last() {
            Some(segment) => segment.remaining() == 0,
            None => true,
        };
        if needs_new {
            let is_first = self.segments.is_empty();
            let mut segment = pool.rent_for_hint(hint);
            if reserve_header && is_first {
                segment.advance(HEADER_RESERVE);
            }
            self.segments.push(segment);
        }
        self.segments.last_mut().expect("segment just ensured")
    }

    /// Appends a freshly rented segment regardless of the current tail's
    /// remaining capacity. Used when a caller detects zero forward progress
    /// against the existing tail and needs guaranteed fresh room.
    pub fn force_new_segment(&mut self, pool: &SegmentPool, min_size: usize) {
        self.segments.push(pool.rent(min_size));
    }

    /// Releases every segment in the chain back to `pool`, exactly once each,
    /// consuming the chain so it cannot be released twice.
    pub fn release(mut self, pool: &SegmentPool) {
        for segment in self.segments.drain(..) {
            pool.release_one(segment);
        }
    }

    /// Copies every segment's written bytes into one contiguous buffer. Used at
    /// the point a receive buffer is finalized into an owned `Message`
    /// payload — the one deliberate copy at the pipeline's boundary, not a hidden
    /// cost threaded through every intermediate step.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_written());
        for segment in &self.segments {
            out.extend_from_slice(segment.written());
        }
        out
    }

    /// Strips up to `n` already-written trailing bytes, dropping the tail
    /// segment entirely (and continuing into the previous one) when it
    /// holds fewer than `n` bytes of its own — the `permessage-deflate`
    /// trailer-strip boundary case.
    pub fn rewind_tail(&mut self, pool: &SegmentPool, mut n: usize) {
        while n > 0 {
            let Some(tail) = self.segments.last_mut() else { break };
            let written = tail.position();
            if n < written {
                tail.rewind(n);
                break;
            }
            n -= written;
            let popped = self.segments.pop().expect("last_mut just matched Some");
            pool.release_one(popped);
        }
    }
}

impl Default for SegmentChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_floors_to_default_segment_size() {
        let pool = SegmentPool::new();
        let segment = pool.rent(10);
        assert_eq!(segment.capacity(), DEFAULT_SEGMENT_SIZE);
    }

    #[test]
    fn rent_for_hint_reserves_header_space() {
        let pool = SegmentPool::new();
        let segment = pool.rent_for_hint(20_000);
        assert!(segment.capacity() >= 20_000 + HEADER_RESERVE);
    }

    #[test]
    fn released_segments_are_recycled() {
        let pool = SegmentPool::new();
        let segment = pool.rent(10);
        pool.release_one(segment);
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let _reused = pool.rent(10);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn chain_release_is_exactly_once_and_empties_the_chain() {
        let pool = SegmentPool::new();
        let mut chain = SegmentChain::new();
        chain.append(pool.rent(10));
        chain.append(pool.rent(10));
        assert_eq!(chain.len(), 2);
        chain.release(&pool);
        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }

    #[test]
    fn advance_and_write_tracking() {
        let mut segment = SegmentPool::new().rent(10);
        segment.available_mut()[..5].copy_from_slice(b"hello");
        segment.advance(5);
        assert_eq!(segment.written(), b"hello");
        assert_eq!(segment.position(), 5);
    }

    #[test]
    fn to_contiguous_concatenates_every_segment() {
        let pool = SegmentPool::new();
        let mut chain = SegmentChain::new();
        let mut a = pool.rent(10);
        a.available_mut()[..3].copy_from_slice(b"abc");
        a.advance(3);
        let mut b = pool.rent(10);
        b.available_mut()[..3].copy_from_slice(b"def");
        b.advance(3);
        chain.append(a);
        chain.append(b);
        assert_eq!(chain.to_contiguous(), b"abcdef");
    }
}
