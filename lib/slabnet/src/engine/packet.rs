// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packets and the operations that move bytes in and out of them.
//!
//! A [`Packet`] is an ordered chain of one or more slabs, each
//! represented by a [`Seg`]. A segment owns its slab outright: it is
//! the only way to reach the slab's bytes, and dropping it returns the
//! slab to its pool. Consequently a packet can never leak a slab,
//! whatever path it takes through the stack.
//!
//! Within a slab the used bytes form a window `[head, tail)` of the
//! fixed payload area `[0, payload_size)`. Headers are prepended by
//! moving `head` down; payload is appended by moving `tail` up.
//!
//! The slabs of one chain need not come from the same pool.

use super::pool::PacketPool;
use super::pool::PoolError;
use super::pool::QueueKind;
use super::pool::SlabId;
use super::pool::SlabState;
use super::pool::WaitOption;
use alloc::vec::Vec;
use core::cmp;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::slice;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("need {needed} bytes of head room, have {available}")]
    Underflow { needed: usize, available: usize },

    #[error("buffer of {available} bytes cannot hold {needed}")]
    Overflow { needed: usize, available: usize },

    #[error("offset {offset} is beyond packet length {len}")]
    OffsetError { offset: usize, len: usize },

    #[error("chain holds {walked} bytes but claims {declared}")]
    InvalidPacket { declared: usize, walked: usize },

    #[error("cannot reserve {0} header bytes")]
    InvalidParameter(usize),
}

impl PacketError {
    /// The status code of this error.
    pub fn code(&self) -> u32 {
        match self {
            Self::Pool(e) => e.code(),
            Self::Underflow { .. } => 0x02,
            Self::Overflow { .. } => 0x03,
            Self::InvalidPacket { .. } => 0x12,
            Self::InvalidParameter(_) => 0x4D,
            Self::OffsetError { .. } => 0x53,
        }
    }
}

/// A release that was refused. The packet is handed back untouched.
#[derive(Debug, thiserror::Error)]
#[error("packet not released: {err}")]
pub struct ReleaseError {
    pub err: PoolError,
    pub pkt: Packet,
}

/// The outcome of [`Packet::transmit_release()`].
#[derive(Debug)]
pub enum TxDone {
    /// The packet's slabs are back in their pools.
    Released,
    /// The packet is still held for retransmission. It is marked
    /// driver-done and returned to the caller, who owns the eventual
    /// release.
    Deferred(Packet),
}

/// One slab of a packet chain.
pub struct Seg {
    pool: PacketPool,
    id: SlabId,
    head: usize,
    tail: usize,
}

/// A segment taken apart with [`Packet::into_raw()`].
///
/// It can only be made by taking a packet apart, so it always names
/// a slab that nothing else owns.
#[derive(Debug)]
pub struct RawSeg {
    pool: PacketPool,
    id: SlabId,
    head: usize,
    tail: usize,
}

impl RawSeg {
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn id(&self) -> SlabId {
        self.id
    }

    /// The used window `[head, tail)` within the slab.
    pub fn window(&self) -> (usize, usize) {
        (self.head, self.tail)
    }
}

impl Seg {
    pub(crate) fn new(pool: PacketPool, id: SlabId, offset: usize) -> Self {
        Self { pool, id, head: offset, tail: offset }
    }

    fn capacity(&self) -> usize {
        self.pool.payload_size()
    }

    fn len(&self) -> usize {
        self.tail - self.head
    }

    fn tail_room(&self) -> usize {
        self.capacity() - self.tail
    }

    fn slab(&self) -> &[u8] {
        // SAFETY: This segment is the sole owner of slab `id` for as
        // long as it lives, so no other reference to these bytes
        // exists, and the range is within the region.
        unsafe {
            slice::from_raw_parts(self.pool.payload_ptr(self.id), self.capacity())
        }
    }

    fn slab_mut(&mut self) -> &mut [u8] {
        // SAFETY: As for `slab()`; `&mut self` makes this the only
        // live reference.
        unsafe {
            slice::from_raw_parts_mut(
                self.pool.payload_ptr(self.id),
                self.capacity(),
            )
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.slab()[self.head..self.tail]
    }

    /// Copy as much of `src` as fits after the tail, returning the
    /// number of bytes copied.
    fn write_back(&mut self, src: &[u8]) -> usize {
        let n = cmp::min(src.len(), self.tail_room());
        let tail = self.tail;
        self.slab_mut()[tail..tail + n].copy_from_slice(&src[..n]);
        self.tail += n;
        n
    }

    fn write_front(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.head);
        let (head, old) = (self.head - src.len(), self.head);
        self.slab_mut()[head..old].copy_from_slice(src);
        self.head = head;
    }

    /// Slide the used window so it starts at `head`.
    fn move_to(&mut self, head: usize) {
        let len = self.len();
        debug_assert!(head + len <= self.capacity());
        let (old, tail) = (self.head, self.tail);
        self.slab_mut().copy_within(old..tail, head);
        self.head = head;
        self.tail = head + len;
    }

    fn into_raw(self) -> RawSeg {
        let seg = ManuallyDrop::new(self);
        // SAFETY: `seg` is never dropped, so the pool handle is moved
        // out exactly once.
        let pool = unsafe { ptr::read(&seg.pool) };
        RawSeg { pool, id: seg.id, head: seg.head, tail: seg.tail }
    }
}

impl Drop for Seg {
    fn drop(&mut self) {
        // Only a slab that is already free is refused, and a live
        // segment's slab never is; the pool counts it if it happens.
        let _ = self.pool.reclaim(self.id, false);
    }
}

/// A packet: a chain of slabs holding one logical run of bytes.
///
/// A packet always holds at least one slab. The first slab carries
/// the packet's queue state (see [`Packet::enqueue()`]).
pub struct Packet {
    segs: Vec<Seg>,
    len: usize,
    driver_done: bool,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool().name())
            .field("len", &self.len)
            .field("segs", &self.segs.len())
            .field("driver_done", &self.driver_done)
            .finish()
    }
}

impl Packet {
    pub(crate) fn from_seg(seg: Seg) -> Self {
        Self { segs: vec![seg], len: 0, driver_done: false }
    }

    fn head(&self) -> &Seg {
        &self.segs[0]
    }

    fn into_segs(mut self) -> Vec<Seg> {
        core::mem::take(&mut self.segs)
    }

    /// The total number of bytes held across the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn seg_count(&self) -> usize {
        self.segs.len()
    }

    /// The pool the first slab came from.
    pub fn pool(&self) -> &PacketPool {
        &self.head().pool
    }

    pub fn head_slab(&self) -> SlabId {
        self.head().id
    }

    /// Bytes free in front of the data in the first slab.
    pub fn head_room(&self) -> usize {
        self.head().head
    }

    /// Bytes free after the data in the last slab.
    pub fn tail_room(&self) -> usize {
        self.segs.last().map(Seg::tail_room).unwrap_or(0)
    }

    /// The used bytes of each slab, in order.
    pub fn segs(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Seg::bytes)
    }

    pub fn copy_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segs {
            out.extend_from_slice(seg.bytes());
        }
        out
    }

    /// Append `src` to the end of the chain.
    ///
    /// Space left in the last slab is used first. Whatever does not
    /// fit goes into new slabs allocated from `pool` with `wait`. If
    /// any of those allocations fails, every slab taken by this call
    /// is returned and the packet is left as it was.
    pub fn append(
        &mut self,
        src: &[u8],
        pool: &PacketPool,
        wait: WaitOption,
    ) -> Result<(), PacketError> {
        let room = self.tail_room();
        let mut fresh = Vec::new();

        if src.len() > room {
            let needed = (src.len() - room).div_ceil(pool.payload_size());
            for _ in 0..needed {
                // On error `fresh` is dropped, which returns its slabs.
                fresh.push(pool.allocate_seg(0, wait)?);
            }
        }

        let mut rest = src;
        if let Some(last) = self.segs.last_mut() {
            let n = last.write_back(rest);
            rest = &rest[n..];
        }

        for mut seg in fresh {
            let n = seg.write_back(rest);
            rest = &rest[n..];
            self.segs.push(seg);
        }

        debug_assert!(rest.is_empty());
        self.len += src.len();
        Ok(())
    }

    /// Copy the whole chain into `dst`, returning the bytes copied.
    pub fn retrieve(&self, dst: &mut [u8]) -> Result<usize, PacketError> {
        let walked: usize = self.segs.iter().map(Seg::len).sum();
        if walked != self.len {
            return Err(PacketError::InvalidPacket {
                declared: self.len,
                walked,
            });
        }

        if dst.len() < self.len {
            return Err(PacketError::Overflow {
                needed: self.len,
                available: dst.len(),
            });
        }

        let mut n = 0;
        for seg in &self.segs {
            let b = seg.bytes();
            dst[n..n + b.len()].copy_from_slice(b);
            n += b.len();
        }
        Ok(n)
    }

    /// Copy up to `dst.len()` bytes starting at `offset` without
    /// consuming them.
    ///
    /// An offset at or past the end is an error, except that offset
    /// 0 of an empty packet copies nothing and succeeds.
    pub fn extract_offset(
        &self,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<usize, PacketError> {
        if offset >= self.len {
            if offset == 0 {
                return Ok(0);
            }
            return Err(PacketError::OffsetError { offset, len: self.len });
        }

        let mut rdr = self.reader(offset);
        let mut n = 0;
        while n < dst.len() {
            let Some(run) = rdr.next_run(dst.len() - n) else {
                break;
            };
            dst[n..n + run.len()].copy_from_slice(run);
            n += run.len();
        }
        Ok(n)
    }

    /// Make sure `header_size` bytes are free in front of the data in
    /// the first slab, so a header can be prepended without spanning
    /// slabs.
    ///
    /// In order of preference: do nothing if the room is already
    /// there; slide the first slab's data toward its end if the slab
    /// has enough free space overall; otherwise move the tail of the
    /// first slab's data into a new slab linked right after it. The
    /// last case needs an even `header_size`, and the new slab is
    /// taken without waiting.
    ///
    /// The bytes of the packet are unchanged in every case.
    pub fn adjust(&mut self, header_size: usize) -> Result<(), PacketError> {
        let first = &mut self.segs[0];
        let cap = first.capacity();

        if header_size > cap {
            return Err(PacketError::InvalidParameter(header_size));
        }

        if first.head >= header_size {
            return Ok(());
        }

        if header_size + first.len() <= cap {
            first.move_to(header_size);
            return Ok(());
        }

        if header_size % 2 != 0 {
            return Err(PacketError::InvalidParameter(header_size));
        }

        let keep = cap - header_size;
        let mut spill = first.pool.allocate_seg(0, WaitOption::NoWait)?;
        let split = first.head + keep;
        spill.write_back(&first.slab()[split..first.tail]);
        first.tail = split;
        first.move_to(header_size);
        self.segs.insert(1, spill);
        Ok(())
    }

    /// Write `hdr` directly in front of the data.
    pub fn prepend(&mut self, hdr: &[u8]) -> Result<(), PacketError> {
        let first = &mut self.segs[0];
        if first.head < hdr.len() {
            return Err(PacketError::Underflow {
                needed: hdr.len(),
                available: first.head,
            });
        }

        first.write_front(hdr);
        self.len += hdr.len();
        Ok(())
    }

    /// Remove `n` bytes from the front. Slabs emptied along the way
    /// are released, though the packet always keeps one.
    pub fn trim_front(&mut self, mut n: usize) -> Result<(), PacketError> {
        if n > self.len {
            return Err(PacketError::OffsetError { offset: n, len: self.len });
        }

        self.len -= n;
        while n > 0 {
            let first = &mut self.segs[0];
            let take = cmp::min(n, first.len());
            first.head += take;
            n -= take;

            if first.len() == 0 && self.segs.len() > 1 {
                self.segs.remove(0);
            }
        }
        Ok(())
    }

    /// Shorten the packet to `len` bytes. Slabs left holding nothing
    /// are released, though the packet always keeps one.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }

        let mut left = len;
        let mut keep = 1;
        for (i, seg) in self.segs.iter_mut().enumerate() {
            let seg_len = seg.len();
            if left <= seg_len {
                seg.tail = seg.head + left;
                keep = i + 1;
                break;
            }
            left -= seg_len;
        }

        self.segs.truncate(keep);
        self.len = len;
    }

    /// Link the slabs of `other` after the slabs of this packet.
    /// No bytes are copied.
    pub fn append_chain(&mut self, other: Packet) {
        self.len += other.len;
        self.segs.extend(other.into_segs());
    }

    /// A deep copy of this packet in new slabs from `pool`, keeping
    /// the same head room where the pool allows it.
    pub fn duplicate(
        &self,
        pool: &PacketPool,
        wait: WaitOption,
    ) -> Result<Packet, PacketError> {
        let offset = cmp::min(self.head_room(), pool.payload_size());
        let mut copy = pool.allocate(offset, wait)?;
        for seg in &self.segs {
            copy.append(seg.bytes(), pool, wait)?;
        }
        Ok(copy)
    }

    /// Mark the packet as held on a protocol queue. While queued it
    /// cannot be released with [`Packet::release()`].
    pub fn enqueue(&mut self, kind: QueueKind) {
        let head = self.head();
        head.pool.set_state(head.id, SlabState::Queued(kind));
    }

    /// Take the packet back off its protocol queue.
    pub fn dequeue(&mut self) {
        let head = self.head();
        head.pool.set_state(head.id, SlabState::Allocated);
    }

    pub fn state(&self) -> SlabState {
        let head = self.head();
        head.pool.state_of(head.id)
    }

    /// Has the driver finished with a packet held for retransmission?
    pub fn driver_done(&self) -> bool {
        self.driver_done
    }

    /// Return every slab of the chain to its pool.
    ///
    /// A packet that is still on a protocol queue is refused: the
    /// pool counts an invalid release and the packet comes back in
    /// the error, untouched.
    pub fn release(self) -> Result<(), ReleaseError> {
        let head = self.head();
        if let Err(err) = head.pool.reclaim(head.id, true) {
            return Err(ReleaseError { err, pkt: self });
        }

        let mut segs = self.into_segs();
        // The first slab is already back in its pool.
        drop(segs.remove(0).into_raw());
        drop(segs);
        Ok(())
    }

    /// Release a packet once the driver is done with it.
    ///
    /// A packet still held for retransmission is not freed here; it
    /// is marked driver-done and handed back to be released by its
    /// holder.
    pub fn transmit_release(mut self) -> Result<TxDone, ReleaseError> {
        if self.state() == SlabState::Queued(QueueKind::Retransmit) {
            self.driver_done = true;
            return Ok(TxDone::Deferred(self));
        }

        self.release().map(|()| TxDone::Released)
    }

    /// Take the chain apart. The caller now owns every slab and must
    /// return each with [`PacketPool::release_slab()`] or rebuild the
    /// packet with [`Packet::from_raw()`].
    pub fn into_raw(self) -> Vec<RawSeg> {
        self.into_segs().into_iter().map(Seg::into_raw).collect()
    }

    /// Rebuild a packet from the parts returned by
    /// [`Packet::into_raw()`]. Returns `None` for an empty chain.
    pub fn from_raw(raw: Vec<RawSeg>) -> Option<Packet> {
        if raw.is_empty() {
            return None;
        }

        let segs: Vec<Seg> = raw
            .into_iter()
            .map(|r| Seg { pool: r.pool, id: r.id, head: r.head, tail: r.tail })
            .collect();
        let len = segs.iter().map(Seg::len).sum();
        Some(Packet { segs, len, driver_done: false })
    }

    /// Read the chain from `offset` onward in runs that never cross
    /// a slab boundary.
    pub fn reader(&self, offset: usize) -> PacketReader<'_> {
        let mut rdr = PacketReader { segs: &self.segs, idx: 0, off: 0 };
        rdr.skip(offset);
        rdr
    }

    #[cfg(any(test, feature = "test-help"))]
    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }
}

/// A forward-only cursor over the bytes of a packet.
pub struct PacketReader<'a> {
    segs: &'a [Seg],
    idx: usize,
    off: usize,
}

impl<'a> PacketReader<'a> {
    /// The next run of at most `max` bytes, `None` once the chain is
    /// exhausted.
    pub fn next_run(&mut self, max: usize) -> Option<&'a [u8]> {
        while let Some(seg) = self.segs.get(self.idx) {
            let b = seg.bytes();
            if self.off < b.len() {
                let n = cmp::min(max, b.len() - self.off);
                let run = &b[self.off..self.off + n];
                self.off += n;
                return Some(run);
            }
            self.idx += 1;
            self.off = 0;
        }
        None
    }

    /// Skip `n` bytes, returning how many were actually skipped.
    pub fn skip(&mut self, mut n: usize) -> usize {
        let want = n;
        while n > 0 {
            match self.next_run(n) {
                Some(run) => n -= run.len(),
                None => break,
            }
        }
        want - n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;

    fn pool(payload: usize, count: usize) -> PacketPool {
        PacketPool::with_capacity("test", payload, count).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn append_spans_slabs() {
        let p = pool(256, 8);
        let mut pkt = p.allocate(16, WaitOption::NoWait).unwrap();
        let src = pattern(1000);
        pkt.append(&src, &p, WaitOption::NoWait).unwrap();

        // 240 in the first slab, then ceil(760 / 256) more.
        assert_eq!(pkt.seg_count(), 4);
        assert_eq!(pkt.len(), 1000);
        assert_eq!(p.available(), 4);

        let mut out = vec![0u8; 1000];
        assert_eq!(pkt.retrieve(&mut out), Ok(1000));
        assert_eq!(out, src);
    }

    #[test]
    fn append_uses_existing_room_first() {
        let p = pool(64, 4);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(40), &p, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(24), &p, WaitOption::NoWait).unwrap();
        assert_eq!(pkt.seg_count(), 1);
        assert_eq!(pkt.tail_room(), 0);
        pkt.append(&[1], &p, WaitOption::NoWait).unwrap();
        assert_eq!(pkt.seg_count(), 2);
    }

    #[test]
    fn append_failure_returns_new_slabs() {
        let p = pool(64, 3);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(10), &p, WaitOption::NoWait).unwrap();

        // Needs 4 more slabs, only 2 exist.
        let err = pkt.append(&pattern(300), &p, WaitOption::NoWait).unwrap_err();
        assert_eq!(err, PacketError::Pool(PoolError::NoPacket));
        assert_eq!(err.code(), 0x01);
        assert_eq!(p.available(), 2);
        assert_eq!(pkt.len(), 10);
        assert_eq!(pkt.seg_count(), 1);
        assert_eq!(pkt.copy_all(), pattern(10));
    }

    #[test]
    fn append_from_another_pool() {
        let small = pool(32, 1);
        let big = pool(512, 2);
        let mut pkt = small.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(100), &big, WaitOption::NoWait).unwrap();
        assert_eq!(pkt.seg_count(), 2);
        assert_eq!(big.available(), 1);

        pkt.release().unwrap();
        assert_eq!(small.available(), 1);
        assert_eq!(big.available(), 2);
    }

    #[test]
    fn random_round_trips() {
        let p = pool(128, 64);
        let mut rng = rand::rng();

        for _ in 0..50 {
            let offset = rng.random_range(0..=64);
            let mut pkt = p.allocate(offset, WaitOption::NoWait).unwrap();
            let mut expect = vec![];

            for _ in 0..rng.random_range(1..6) {
                let mut chunk = vec![0u8; rng.random_range(0..400)];
                rng.fill(&mut chunk[..]);
                pkt.append(&chunk, &p, WaitOption::NoWait).unwrap();
                expect.extend_from_slice(&chunk);
            }

            let first = 128 - offset;
            let slabs = 1 + expect.len().saturating_sub(first).div_ceil(128);
            assert_eq!(pkt.seg_count(), slabs);
            assert_eq!(pkt.copy_all(), expect);
        }

        assert_eq!(p.available(), 64);
    }

    #[test]
    fn retrieve_checks() {
        let p = pool(64, 4);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(100), &p, WaitOption::NoWait).unwrap();

        let mut small = [0u8; 99];
        assert_eq!(
            pkt.retrieve(&mut small),
            Err(PacketError::Overflow { needed: 100, available: 99 })
        );

        pkt.set_len(120);
        let mut out = [0u8; 200];
        let err = pkt.retrieve(&mut out).unwrap_err();
        assert_eq!(err, PacketError::InvalidPacket { declared: 120, walked: 100 });
        assert_eq!(err.code(), 0x12);
    }

    #[test]
    fn extract_offset_peeks() {
        let p = pool(64, 4);
        let mut pkt = p.allocate(8, WaitOption::NoWait).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(pkt.extract_offset(0, &mut buf), Ok(0));
        assert_eq!(
            pkt.extract_offset(1, &mut buf),
            Err(PacketError::OffsetError { offset: 1, len: 0 })
        );

        let src = pattern(150);
        pkt.append(&src, &p, WaitOption::NoWait).unwrap();

        // Crosses the boundary between the first and second slab.
        assert_eq!(pkt.extract_offset(50, &mut buf), Ok(16));
        assert_eq!(&buf[..], &src[50..66]);

        // Runs off the end.
        assert_eq!(pkt.extract_offset(140, &mut buf), Ok(10));
        assert_eq!(&buf[..10], &src[140..]);

        assert!(pkt.extract_offset(150, &mut buf).is_err());
        assert_eq!(pkt.copy_all(), src);
    }

    #[test]
    fn adjust_noop_with_room() {
        let p = pool(64, 2);
        let mut pkt = p.allocate(20, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(30), &p, WaitOption::NoWait).unwrap();
        pkt.adjust(20).unwrap();
        assert_eq!(pkt.head_room(), 20);
        assert_eq!(pkt.seg_count(), 1);
    }

    #[test]
    fn adjust_slides_in_place() {
        let p = pool(64, 2);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(30), &p, WaitOption::NoWait).unwrap();
        pkt.adjust(20).unwrap();
        assert_eq!(pkt.head_room(), 20);
        assert_eq!(pkt.seg_count(), 1);
        assert_eq!(pkt.copy_all(), pattern(30));
        assert_eq!(p.available(), 1);
    }

    #[test]
    fn adjust_splits_into_new_slab() {
        let p = pool(64, 3);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        let src = pattern(100);
        pkt.append(&src, &p, WaitOption::NoWait).unwrap();
        assert_eq!(pkt.seg_count(), 2);

        pkt.adjust(20).unwrap();
        assert_eq!(pkt.head_room(), 20);
        assert_eq!(pkt.seg_count(), 3);
        assert_eq!(pkt.len(), 100);
        assert_eq!(pkt.copy_all(), src);

        let sizes: Vec<usize> = pkt.segs().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![44, 20, 36]);

        pkt.prepend(&[0xAA; 20]).unwrap();
        assert_eq!(pkt.len(), 120);
        assert_eq!(pkt.head_room(), 0);
    }

    #[test]
    fn adjust_rejects() {
        let p = pool(64, 2);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(64), &p, WaitOption::NoWait).unwrap();

        assert_eq!(pkt.adjust(65), Err(PacketError::InvalidParameter(65)));
        assert_eq!(pkt.adjust(21), Err(PacketError::InvalidParameter(21)));
        assert_eq!(pkt.copy_all(), pattern(64));

        // The split path never waits.
        let _last = p.allocate(0, WaitOption::NoWait).unwrap();
        assert_eq!(
            pkt.adjust(20),
            Err(PacketError::Pool(PoolError::NoPacket))
        );
        assert_eq!(pkt.copy_all(), pattern(64));
    }

    #[test]
    fn prepend_needs_room() {
        let p = pool(64, 1);
        let mut pkt = p.allocate(4, WaitOption::NoWait).unwrap();
        assert_eq!(
            pkt.prepend(&[0; 8]),
            Err(PacketError::Underflow { needed: 8, available: 4 })
        );
        pkt.prepend(&[1, 2, 3, 4]).unwrap();
        assert_eq!(pkt.copy_all(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn trim_and_truncate_release_slabs() {
        let p = pool(32, 8);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        let src = pattern(150);
        pkt.append(&src, &p, WaitOption::NoWait).unwrap();
        assert_eq!(pkt.seg_count(), 5);

        pkt.trim_front(40).unwrap();
        assert_eq!(pkt.seg_count(), 4);
        assert_eq!(pkt.copy_all(), &src[40..]);

        pkt.truncate(50);
        assert_eq!(pkt.len(), 50);
        assert_eq!(pkt.seg_count(), 2);
        assert_eq!(pkt.copy_all(), &src[40..90]);
        assert_eq!(p.available(), 6);

        pkt.truncate(0);
        assert_eq!(pkt.len(), 0);
        assert_eq!(pkt.seg_count(), 1);

        assert!(pkt.trim_front(1).is_err());
    }

    #[test]
    fn chains_join_without_copy() {
        let p = pool(64, 4);
        let mut a = p.allocate(0, WaitOption::NoWait).unwrap();
        a.append(&pattern(10), &p, WaitOption::NoWait).unwrap();
        let mut b = p.allocate(0, WaitOption::NoWait).unwrap();
        b.append(&[9; 5], &p, WaitOption::NoWait).unwrap();

        a.append_chain(b);
        assert_eq!(a.len(), 15);
        assert_eq!(a.seg_count(), 2);
        assert_eq!(&a.copy_all()[10..], &[9; 5]);
        drop(a);
        assert_eq!(p.available(), 4);
    }

    #[test]
    fn duplicate_is_deep() {
        let p = pool(64, 8);
        let mut pkt = p.allocate(12, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(100), &p, WaitOption::NoWait).unwrap();

        let copy = pkt.duplicate(&p, WaitOption::NoWait).unwrap();
        assert_eq!(copy.copy_all(), pkt.copy_all());
        assert_eq!(copy.head_room(), 12);
        assert_ne!(copy.head_slab(), pkt.head_slab());

        pkt.truncate(1);
        assert_eq!(copy.len(), 100);
    }

    #[test]
    fn queued_packet_refuses_release() {
        let p = pool(64, 1);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.enqueue(QueueKind::ResolutionPending);
        assert_eq!(pkt.state(), SlabState::Queued(QueueKind::ResolutionPending));

        let ReleaseError { err, mut pkt } = pkt.release().unwrap_err();
        assert_eq!(err, PoolError::PtrError(pkt.head_slab()));
        assert_eq!(p.stats().invalid_releases, 1);
        assert_eq!(p.available(), 0);

        pkt.dequeue();
        pkt.release().unwrap();
        assert_eq!(p.available(), 1);
    }

    #[test]
    fn transmit_release_defers_retransmit() {
        let p = pool(64, 2);
        let plain = p.allocate(0, WaitOption::NoWait).unwrap();
        assert!(matches!(plain.transmit_release(), Ok(TxDone::Released)));

        let mut held = p.allocate(0, WaitOption::NoWait).unwrap();
        held.enqueue(QueueKind::Retransmit);
        let Ok(TxDone::Deferred(mut held)) = held.transmit_release() else {
            panic!("expected deferred release");
        };
        assert!(held.driver_done());
        assert_eq!(p.available(), 1);

        held.dequeue();
        held.release().unwrap();
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn raw_round_trip() {
        let p = pool(64, 4);
        let mut pkt = p.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(&pattern(100), &p, WaitOption::NoWait).unwrap();

        let raw = pkt.into_raw();
        assert_eq!(raw.len(), 2);
        assert_eq!(p.available(), 2);

        let pkt = Packet::from_raw(raw).unwrap();
        assert_eq!(pkt.copy_all(), pattern(100));
        drop(pkt);
        assert_eq!(p.available(), 4);
        assert!(Packet::from_raw(vec![]).is_none());
    }
}
