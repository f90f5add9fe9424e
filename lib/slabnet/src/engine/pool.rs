// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fixed-size packet pools.
//!
//! A pool carves one contiguous, caller-supplied region into
//! equally sized slabs at creation time and never allocates again.
//! Each slab is charged [`SLAB_HDR_LEN`] bytes of bookkeeping plus
//! its payload capacity rounded up to [`PACKET_ALIGN`], so the number
//! of slabs a region yields is fixed by its size alone.
//!
//! Slabs are named by [`SlabId`] and their state lives in a table
//! beside the region, guarded by a single mutex. That mutex is held
//! only to pop or push a free-list entry, queue or dequeue a waiter,
//! and bump a counter. Payload bytes are never touched under it.
//!
//! # Waiting
//!
//! An allocation that finds the pool empty may wait. Waiters queue
//! in FIFO order. A release that finds a waiter hands its slab
//! straight to the oldest one instead of returning it to the free
//! list, re-initializing the data window with the offset that waiter
//! asked for. A wait ends in exactly one of three ways: a slab is
//! handed over, the timeout passes ([`PoolError::NoPacket`]), or the
//! pool is deleted ([`PoolError::PoolDeleted`]).

use super::packet::Packet;
use super::packet::RawSeg;
use super::packet::Seg;
use crate::sys::kstat::KStatNamed;
use crate::sys::kstat::KStatProvider;
use crate::sys::kstat::KStatU64;
use crate::sys::sync::KCondvar;
use crate::sys::sync::KMutex;
use crate::sys::time::Deadline;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::time::Duration;
use kstat_macro::KStatProvider;

/// Alignment of every slab's payload area: the platform word.
pub const PACKET_ALIGN: usize = core::mem::size_of::<usize>();

/// Bookkeeping bytes charged against the region for every slab.
pub const SLAB_HDR_LEN: usize = 32;

/// How long an allocation may wait for a slab.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOption {
    /// Fail immediately if the pool is empty.
    NoWait,
    /// Wait at most this long.
    Timeout(Duration),
    /// Wait until a slab is released or the pool is deleted.
    Forever,
}

impl WaitOption {
    fn deadline(&self) -> Deadline {
        match self {
            Self::NoWait => Deadline::after(Duration::ZERO),
            Self::Timeout(d) => Deadline::after(*d),
            Self::Forever => Deadline::never(),
        }
    }
}

/// Identifies one slab within its pool.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SlabId(u32);

impl SlabId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A protocol queue that may hold a packet after allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// Held by a transport for possible retransmission.
    Retransmit,
    /// Waiting on next-hop address resolution.
    ResolutionPending,
    /// Held as a fragment of an incomplete datagram.
    Reassembly,
}

/// The lifecycle state of a slab.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlabState {
    Free,
    Allocated,
    Queued(QueueKind),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("no packet available")]
    NoPacket,

    #[error("pool has been deleted")]
    PoolDeleted,

    #[error("slab {0} is not allocated to the caller")]
    PtrError(SlabId),

    #[error("region of {region} bytes cannot hold a slab of {payload_size} bytes")]
    SizeError { region: usize, payload_size: usize },

    #[error("header reserve {offset} exceeds payload capacity {capacity}")]
    InvalidParameter { offset: usize, capacity: usize },

    #[error("bad pool name: {0}")]
    BadName(String),
}

impl PoolError {
    /// The status code of this error.
    pub fn code(&self) -> u32 {
        match self {
            Self::NoPacket => 0x01,
            Self::PtrError(_) => 0x07,
            Self::SizeError { .. } => 0x09,
            Self::PoolDeleted => 0x30,
            Self::InvalidParameter { .. } | Self::BadName(_) => 0x4D,
        }
    }
}

#[derive(KStatProvider)]
pub struct PoolStats {
    /// Allocations that found the pool empty.
    pub empty_requests: KStatU64,
    /// Allocations that found the pool empty and waited.
    pub empty_suspensions: KStatU64,
    /// Releases of a slab that was not allocated to the caller.
    pub invalid_releases: KStatU64,
    pub allocations: KStatU64,
    pub releases: KStatU64,
    /// Releases handed directly to a waiting allocator.
    pub handoffs: KStatU64,
}

/// The backing region, owned by the pool for its whole life.
///
/// The region is taken apart into its raw parts at creation so that
/// slab payloads can be reached through a pointer rather than a
/// borrow of the `Vec`; it is put back together only to be freed.
struct Region {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

// SAFETY: The region is plain bytes. Access to any one slab's bytes
// is confined to the single `Seg` that owns that slab (see
// `PoolInner::payload_ptr()`).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(region: Vec<u8>) -> Self {
        let mut region = ManuallyDrop::new(region);
        let len = region.len();
        let cap = region.capacity();
        // A Vec's pointer is never null, even when it has not
        // allocated.
        let ptr = NonNull::new(region.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { ptr, len, cap }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: These are the exact raw parts taken from the Vec in
        // `Region::new()`, which was never dropped.
        drop(unsafe { Vec::from_raw_parts(self.ptr.as_ptr(), self.len, self.cap) });
    }
}

struct SlabMeta {
    state: SlabState,
    next: Option<SlabId>,
}

struct Waiter {
    ticket: u64,
    offset: usize,
}

enum Handoff {
    Slab { id: SlabId, offset: usize },
    Deleted,
}

struct PoolState {
    slabs: Vec<SlabMeta>,
    free_head: Option<SlabId>,
    available: usize,
    waiters: VecDeque<Waiter>,
    handoffs: BTreeMap<u64, Handoff>,
    next_ticket: u64,
    deleted: bool,
    stats: KStatNamed<PoolStats>,
}

impl PoolState {
    fn pop_free(&mut self) -> Option<SlabId> {
        let id = self.free_head?;
        let meta = &mut self.slabs[id.index()];
        self.free_head = meta.next.take();
        meta.state = SlabState::Allocated;
        self.available -= 1;
        Some(id)
    }

    fn push_free(&mut self, id: SlabId) {
        let meta = &mut self.slabs[id.index()];
        meta.state = SlabState::Free;
        meta.next = self.free_head;
        self.free_head = Some(id);
        self.available += 1;
    }
}

struct PoolInner {
    name: String,
    payload_size: usize,
    slab_size: usize,
    // Offset of the first slab from the start of the region, so that
    // payloads land on a word boundary.
    base_off: usize,
    total: usize,
    region: Region,
    state: KMutex<PoolState>,
    cv: KCondvar,
}

impl PoolInner {
    /// The start of slab `id`'s payload area.
    ///
    /// Slabs do not overlap, so distinct ids yield disjoint
    /// `payload_size` byte ranges within the region.
    fn payload_ptr(&self, id: SlabId) -> *mut u8 {
        let off = self.base_off + id.index() * self.slab_size + SLAB_HDR_LEN;
        debug_assert!(off + self.payload_size <= self.region.len);
        // SAFETY: `off + payload_size` is within the region by
        // construction of `total` in `PacketPool::create()`.
        unsafe { self.region.ptr.as_ptr().add(off) }
    }
}

/// A handle to a packet pool.
///
/// Handles are cheap to clone and every [`Packet`] carries one for
/// each of its slabs. The region stays alive as long as any handle
/// does, so deleting a pool while packets are in flight is safe:
/// those packets can still be released, they just can no longer be
/// waited for.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("name", &self.inner.name)
            .field("payload_size", &self.inner.payload_size)
            .field("total", &self.inner.total)
            .finish()
    }
}

const fn round_up(val: usize, align: usize) -> usize {
    val.div_ceil(align) * align
}

impl PacketPool {
    /// The per-slab footprint for a given payload size.
    pub const fn slab_size(payload_size: usize) -> usize {
        SLAB_HDR_LEN + round_up(payload_size, PACKET_ALIGN)
    }

    /// The region size guaranteed to yield exactly `count` slabs of
    /// `payload_size` bytes, whatever the alignment of the region.
    pub const fn region_size(payload_size: usize, count: usize) -> usize {
        Self::slab_size(payload_size) * count + PACKET_ALIGN - 1
    }

    /// Create a pool of `payload_size` byte slabs over `region`.
    ///
    /// Every slab starts on the free list. Fails if the region, once
    /// aligned, cannot hold a single slab.
    pub fn create(
        name: &str,
        payload_size: usize,
        region: Vec<u8>,
    ) -> Result<Self, PoolError> {
        let region = Region::new(region);
        let slab_size = Self::slab_size(payload_size);
        let base_off = region.ptr.as_ptr().align_offset(PACKET_ALIGN);
        let usable = region.len.saturating_sub(base_off);
        let total = usable / slab_size;

        if payload_size == 0 || total == 0 || total > u32::MAX as usize {
            return Err(PoolError::SizeError { region: region.len, payload_size });
        }

        let stats = KStatNamed::new("slabnet", name, PoolStats::new())
            .map_err(|e| PoolError::BadName(e.to_string()))?;

        // Build the free list so that slab 0 is handed out first.
        let slabs = (0..total)
            .map(|i| SlabMeta {
                state: SlabState::Free,
                next: (i + 1 < total).then(|| SlabId((i + 1) as u32)),
            })
            .collect();

        let state = PoolState {
            slabs,
            free_head: Some(SlabId(0)),
            available: total,
            waiters: VecDeque::new(),
            handoffs: BTreeMap::new(),
            next_ticket: 0,
            deleted: false,
            stats,
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                payload_size,
                slab_size,
                base_off,
                total,
                region,
                state: KMutex::new(state),
                cv: KCondvar::new(),
            }),
        })
    }

    /// Create a pool with a freshly allocated region sized for
    /// exactly `count` slabs.
    pub fn with_capacity(
        name: &str,
        payload_size: usize,
        count: usize,
    ) -> Result<Self, PoolError> {
        let region = vec![0u8; Self::region_size(payload_size, count)];
        Self::create(name, payload_size, region)
    }

    /// Allocate a packet whose data window starts `offset` bytes into
    /// the slab, reserving that much room for headers.
    pub fn allocate(
        &self,
        offset: usize,
        wait: WaitOption,
    ) -> Result<Packet, PoolError> {
        self.allocate_seg(offset, wait).map(Packet::from_seg)
    }

    pub(crate) fn allocate_seg(
        &self,
        offset: usize,
        wait: WaitOption,
    ) -> Result<Seg, PoolError> {
        let capacity = self.inner.payload_size;
        if offset > capacity {
            return Err(PoolError::InvalidParameter { offset, capacity });
        }

        let mut state = self.inner.state.lock();
        if state.deleted {
            return Err(PoolError::PoolDeleted);
        }

        if let Some(id) = state.pop_free() {
            state.stats.vals.allocations += 1;
            drop(state);
            return Ok(Seg::new(self.clone(), id, offset));
        }

        state.stats.vals.empty_requests += 1;
        if wait == WaitOption::NoWait {
            return Err(PoolError::NoPacket);
        }

        state.stats.vals.empty_suspensions += 1;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(Waiter { ticket, offset });
        let deadline = wait.deadline();

        loop {
            if let Some(handoff) = state.handoffs.remove(&ticket) {
                drop(state);
                return match handoff {
                    Handoff::Slab { id, offset } => {
                        Ok(Seg::new(self.clone(), id, offset))
                    }
                    Handoff::Deleted => Err(PoolError::PoolDeleted),
                };
            }

            state = match deadline.remaining() {
                None => self.inner.cv.wait(state),
                Some(left) if left > Duration::ZERO => {
                    self.inner.cv.wait_timeout(state, left).0
                }
                Some(_) => {
                    state.waiters.retain(|w| w.ticket != ticket);
                    return Err(PoolError::NoPacket);
                }
            };
        }
    }

    /// Return one slab taken out of a packet with
    /// [`Packet::into_raw()`].
    ///
    /// The slab must belong to this pool and be in the allocated
    /// state. Anything else, a foreign slab or one still sitting on a
    /// protocol queue, is refused with [`PoolError::PtrError`] and
    /// counted as an invalid release; the slab is left exactly as it
    /// was and handed back.
    pub fn release_slab(&self, raw: RawSeg) -> Result<(), (PoolError, RawSeg)> {
        if !raw.pool().ptr_eq(self) {
            self.inner.state.lock().stats.vals.invalid_releases += 1;
            let id = raw.id();
            return Err((PoolError::PtrError(id), raw));
        }

        match self.reclaim(raw.id(), true) {
            Ok(()) => Ok(()),
            Err(e) => Err((e, raw)),
        }
    }

    /// Return a slab that is allocated or queued. Only a free (or
    /// foreign) slab is refused.
    pub(crate) fn reclaim(&self, id: SlabId, strict: bool) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();

        let ok = match state.slabs.get(id.index()).map(|m| m.state) {
            Some(SlabState::Allocated) => true,
            Some(SlabState::Queued(_)) => !strict,
            Some(SlabState::Free) | None => false,
        };

        if !ok {
            state.stats.vals.invalid_releases += 1;
            return Err(PoolError::PtrError(id));
        }

        state.stats.vals.releases += 1;

        if let Some(waiter) = state.waiters.pop_front() {
            state.slabs[id.index()].state = SlabState::Allocated;
            state.handoffs.insert(
                waiter.ticket,
                Handoff::Slab { id, offset: waiter.offset },
            );
            state.stats.vals.handoffs += 1;
            drop(state);
            self.inner.cv.notify_all();
            return Ok(());
        }

        state.push_free(id);
        Ok(())
    }

    /// Delete the pool.
    ///
    /// Every waiting allocator is woken with
    /// [`PoolError::PoolDeleted`] and later allocations fail the same
    /// way. Packets already handed out are not reclaimed; releasing
    /// them remains valid. Returns the number of waiters woken.
    pub fn delete(&self) -> Result<usize, PoolError> {
        let mut state = self.inner.state.lock();
        if state.deleted {
            return Err(PoolError::PoolDeleted);
        }

        state.deleted = true;
        let woken = state.waiters.len();
        while let Some(w) = state.waiters.pop_front() {
            state.handoffs.insert(w.ticket, Handoff::Deleted);
        }
        drop(state);
        self.inner.cv.notify_all();
        Ok(woken)
    }

    pub(crate) fn set_state(&self, id: SlabId, new: SlabState) {
        self.inner.state.lock().slabs[id.index()].state = new;
    }

    /// The state of a slab owned by a live [`Seg`], whose id is
    /// always in range.
    pub(crate) fn state_of(&self, id: SlabId) -> SlabState {
        self.inner.state.lock().slabs[id.index()].state
    }

    pub fn slab_state(&self, id: SlabId) -> Option<SlabState> {
        let state = self.inner.state.lock();
        state.slabs.get(id.index()).map(|m| m.state)
    }

    /// Raw access to slab `id`'s payload area.
    ///
    /// Only the owner of an allocated slab may call this, and it must
    /// not hold two slices over the same slab at once. [`Seg`] is
    /// that owner.
    pub(crate) fn payload_ptr(&self, id: SlabId) -> *mut u8 {
        self.inner.payload_ptr(id)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn payload_size(&self) -> usize {
        self.inner.payload_size
    }

    pub fn total(&self) -> usize {
        self.inner.total
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Number of allocators currently waiting.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.state.lock().deleted
    }

    pub fn stats(&self) -> PoolStatsSnap {
        self.inner.state.lock().stats.vals.snapshot()
    }

    pub fn ptr_eq(&self, other: &PacketPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
