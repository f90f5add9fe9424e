// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 fragment reassembly.
//!
//! Fragments arrive here with their IP header already removed; the
//! decoded header travels alongside. Fragments of one datagram are
//! matched on source, destination, protocol and identification and
//! held sorted by offset, each tagged as queued for reassembly. When
//! the pieces cover the datagram from offset zero through a final
//! fragment, their slab chains are linked together without copying
//! and the datagram is handed back whole.
//!
//! A fragment at an offset already held replaces the older copy. A
//! fragment that partially overlaps another poisons the whole
//! datagram, which is dropped.

use super::ip4::IPV4_HDR_LEN_MIN;
use super::ip4::Ipv4Flags;
use super::ip4::Ipv4Hdr;
use super::packet::Packet;
use super::pool::QueueKind;
use crate::api::Ipv4Addr;
use crate::sys::time::Instant;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;
use itertools::Itertools;

/// The fields that tie fragments of one datagram together.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct FragKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ident: u16,
}

impl From<&Ipv4Hdr> for FragKey {
    fn from(hdr: &Ipv4Hdr) -> Self {
        Self {
            src: hdr.src,
            dst: hdr.dst,
            proto: u8::from(hdr.proto),
            ident: hdr.ident,
        }
    }
}

#[derive(Debug)]
struct Fragment {
    off: usize,
    more: bool,
    pkt: Packet,
}

impl Fragment {
    fn end(&self) -> usize {
        self.off + self.pkt.len()
    }
}

#[derive(Debug)]
struct Datagram {
    /// The header of the first fragment seen, replaced by that of
    /// the offset zero fragment once it arrives.
    hdr: Ipv4Hdr,
    frags: Vec<Fragment>,
    /// `None` when the hold time runs past what an `Instant` can
    /// represent; such a datagram never times out.
    expires: Option<Instant>,
    seq: u64,
}

impl Datagram {
    /// Does this fragment partially overlap one already held? An
    /// exact match on offset is a retransmission, not an overlap.
    fn overlaps(&self, off: usize, end: usize) -> bool {
        self.frags
            .iter()
            .filter(|f| f.off != off)
            .any(|f| off < f.end() && f.off < end)
    }

    fn is_complete(&self) -> bool {
        let (Some(first), Some(last)) = (self.frags.first(), self.frags.last())
        else {
            return false;
        };

        first.off == 0
            && !last.more
            && self.frags.iter().tuple_windows().all(|(a, b)| a.end() == b.off)
    }

    fn insert(&mut self, hdr: &Ipv4Hdr, mut pkt: Packet) {
        if hdr.frag_off == 0 {
            self.hdr = *hdr;
        }

        pkt.enqueue(QueueKind::Reassembly);
        let frag = Fragment { off: hdr.frag_off, more: hdr.more_frags(), pkt };
        match self.frags.binary_search_by_key(&frag.off, |f| f.off) {
            Ok(i) => self.frags[i] = frag,
            Err(i) => self.frags.insert(i, frag),
        }
    }

    fn join(self) -> Option<(Ipv4Hdr, Packet)> {
        let mut hdr = self.hdr;
        let mut frags = self.frags.into_iter().map(|f| {
            let mut pkt = f.pkt;
            pkt.dequeue();
            pkt
        });

        let mut pkt = frags.next()?;
        for rest in frags {
            pkt.append_chain(rest);
        }

        hdr.flags.remove(Ipv4Flags::MORE_FRAGMENTS);
        hdr.frag_off = 0;
        hdr.hdr_len = IPV4_HDR_LEN_MIN;
        hdr.set_payload_len(pkt.len()).ok()?;
        Some((hdr, pkt))
    }
}

/// What became of a fragment handed to [`Reassembler::insert()`].
#[derive(Debug)]
pub enum Reassembly {
    /// The datagram is whole. The header describes the joined
    /// payload as an unfragmented datagram.
    Complete(Ipv4Hdr, Packet),
    /// Held, waiting on more fragments.
    Held,
    /// The fragment overlapped another or made the datagram too long;
    /// the datagram was dropped.
    Dropped,
}

/// The result of an insert, along with any datagram that had to be
/// evicted to make room.
#[derive(Debug)]
pub struct Inserted {
    pub result: Reassembly,
    pub evicted: bool,
}

/// Datagrams in the process of being reassembled.
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    max: usize,
    in_progress: BTreeMap<FragKey, Datagram>,
    next_seq: u64,
}

impl Reassembler {
    pub fn new(timeout: Duration, max: usize) -> Self {
        Self {
            timeout,
            max: max.max(1),
            in_progress: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Add one fragment. `pkt` holds the fragment's payload only.
    pub fn insert(&mut self, hdr: &Ipv4Hdr, pkt: Packet, now: Instant) -> Inserted {
        let key = FragKey::from(hdr);
        let off = hdr.frag_off;
        let end = off + pkt.len();
        let mut evicted = false;

        if !self.in_progress.contains_key(&key) {
            if self.in_progress.len() >= self.max {
                evicted = self.evict_oldest();
            }

            let hold = self.timeout.max(Duration::from_secs(u64::from(hdr.ttl)));
            let seq = self.next_seq;
            self.next_seq += 1;
            let expires = now.checked_add(hold);
            self.in_progress.insert(
                key,
                Datagram { hdr: *hdr, frags: Vec::new(), expires, seq },
            );
        }

        let Some(dgram) = self.in_progress.get_mut(&key) else {
            return Inserted { result: Reassembly::Dropped, evicted };
        };

        if dgram.overlaps(off, end) || end + IPV4_HDR_LEN_MIN > usize::from(u16::MAX) {
            self.in_progress.remove(&key);
            return Inserted { result: Reassembly::Dropped, evicted };
        }

        dgram.insert(hdr, pkt);
        if !dgram.is_complete() {
            return Inserted { result: Reassembly::Held, evicted };
        }

        let result = self
            .in_progress
            .remove(&key)
            .and_then(Datagram::join)
            .map(|(hdr, pkt)| Reassembly::Complete(hdr, pkt))
            .unwrap_or(Reassembly::Dropped);
        Inserted { result, evicted }
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .in_progress
            .iter()
            .min_by_key(|(_, d)| d.seq)
            .map(|(k, _)| *k);

        oldest.and_then(|k| self.in_progress.remove(&k)).is_some()
    }

    /// Drop every datagram whose time is up, returning how many
    /// were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.in_progress.len();
        self.in_progress
            .retain(|_, d| !matches!(d.expires, Some(at) if at <= now));
        before - self.in_progress.len()
    }

    /// The number of datagrams in progress.
    pub fn len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::engine::pool::PacketPool;
    use crate::engine::pool::WaitOption;

    fn hdr(ident: u16, off: usize, more: bool, len: usize) -> Ipv4Hdr {
        let mut h = Ipv4Hdr::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Protocol::Udp,
            4,
            len,
        )
        .unwrap();
        h.ident = ident;
        h.frag_off = off;
        h.flags.set(Ipv4Flags::MORE_FRAGMENTS, more);
        h
    }

    fn frag(pool: &PacketPool, src: &[u8]) -> Packet {
        let mut pkt = pool.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(src, pool, WaitOption::NoWait).unwrap();
        pkt
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn out_of_order_completes() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(60), 4);
        let now = Instant::now();
        let data = pattern(40);

        let res = r.insert(&hdr(7, 32, false, 8), frag(&pool, &data[32..]), now);
        assert!(matches!(res.result, Reassembly::Held));
        let res = r.insert(&hdr(7, 0, true, 16), frag(&pool, &data[..16]), now);
        assert!(matches!(res.result, Reassembly::Held));
        assert_eq!(r.len(), 1);

        let res = r.insert(&hdr(7, 16, true, 16), frag(&pool, &data[16..32]), now);
        let Reassembly::Complete(h, pkt) = res.result else {
            panic!("expected a complete datagram");
        };

        assert!(!h.is_fragment());
        assert_eq!(h.payload_len(), 40);
        assert_eq!(pkt.copy_all(), data);
        assert_eq!(pkt.seg_count(), 3);
        assert!(r.is_empty());
        drop(pkt);
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn duplicate_offset_replaces() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(60), 4);
        let now = Instant::now();

        r.insert(&hdr(1, 0, true, 8), frag(&pool, &[1; 8]), now);
        r.insert(&hdr(1, 0, true, 8), frag(&pool, &[2; 8]), now);
        assert_eq!(pool.available(), 15);

        let res = r.insert(&hdr(1, 8, false, 4), frag(&pool, &[3; 4]), now);
        let Reassembly::Complete(_, pkt) = res.result else {
            panic!("expected a complete datagram");
        };
        let mut want = vec![2u8; 8];
        want.extend_from_slice(&[3; 4]);
        assert_eq!(pkt.copy_all(), want);
    }

    #[test]
    fn overlap_drops_datagram() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(60), 4);
        let now = Instant::now();

        r.insert(&hdr(1, 0, true, 16), frag(&pool, &[1; 16]), now);
        let res = r.insert(&hdr(1, 8, false, 16), frag(&pool, &[2; 16]), now);
        assert!(matches!(res.result, Reassembly::Dropped));
        assert!(r.is_empty());
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn oldest_evicted_at_capacity() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(60), 2);
        let now = Instant::now();

        assert!(!r.insert(&hdr(1, 0, true, 8), frag(&pool, &[1; 8]), now).evicted);
        assert!(!r.insert(&hdr(2, 0, true, 8), frag(&pool, &[2; 8]), now).evicted);
        assert!(r.insert(&hdr(3, 0, true, 8), frag(&pool, &[3; 8]), now).evicted);
        assert_eq!(r.len(), 2);

        // Datagram 1 is gone, so its tail alone cannot complete it.
        let res = r.insert(&hdr(1, 8, false, 8), frag(&pool, &[1; 8]), now);
        assert!(matches!(res.result, Reassembly::Held));
        assert!(res.evicted);
    }

    #[test]
    fn expiry_uses_larger_of_timeout_and_ttl() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(2), 4);
        let now = Instant::now();

        let mut long = hdr(1, 0, true, 8);
        long.ttl = 30;
        r.insert(&long, frag(&pool, &[1; 8]), now);
        r.insert(&hdr(2, 0, true, 8), frag(&pool, &[2; 8]), now);

        assert_eq!(r.expire(now + Duration::from_secs(1)), 0);
        assert_eq!(r.expire(now + Duration::from_secs(5)), 1);
        assert_eq!(r.len(), 1);
        assert_eq!(r.expire(now + Duration::from_secs(31)), 1);
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn unrepresentable_hold_never_expires() {
        let pool = PacketPool::with_capacity("reasm", 64, 16).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(u64::MAX), 4);
        let now = Instant::now();

        let res = r.insert(&hdr(1, 0, true, 8), frag(&pool, &[1; 8]), now);
        assert!(matches!(res.result, Reassembly::Held));
        assert_eq!(r.expire(now + Duration::from_secs(86_400 * 365)), 0);
        assert_eq!(r.len(), 1);

        let res = r.insert(&hdr(1, 8, false, 8), frag(&pool, &[2; 8]), now);
        let Reassembly::Complete(h, pkt) = res.result else {
            panic!("expected a complete datagram");
        };
        assert_eq!(h.payload_len(), 16);
        drop(pkt);
        assert_eq!(pool.available(), 16);
    }
}
