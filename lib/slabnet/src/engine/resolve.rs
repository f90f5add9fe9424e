// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Next-hop link address resolution.
//!
//! The resolution protocol itself (ARP on Ethernet) lives outside the
//! stack behind [`AddrResolver`]. What the stack owns is the queue of
//! packets waiting on each unresolved next hop: a [`PendingTable`].

use super::iface::IfIndex;
use super::packet::Packet;
use super::pool::QueueKind;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::sys::sync::KMutex;
use crate::sys::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// The resolution protocol, as seen by the IP layer.
pub trait AddrResolver: Send + Sync {
    /// The cached link address for `ip`, if any.
    fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr>;

    /// Start resolving `ip` on `iface`. The answer comes back later
    /// through [`IpStack::resolution_complete()`] or
    /// [`IpStack::resolution_failed()`].
    ///
    /// [`IpStack::resolution_complete()`]: super::ip::IpStack::resolution_complete
    /// [`IpStack::resolution_failed()`]: super::ip::IpStack::resolution_failed
    fn request(&self, iface: IfIndex, ip: Ipv4Addr);
}

/// A resolver backed by a fixed table.
///
/// Requests for addresses not in the table are recorded and
/// otherwise ignored, which leaves the caller to answer them.
#[derive(Default)]
pub struct StaticResolver {
    table: KRwLock<BTreeMap<Ipv4Addr, MacAddr>>,
    requests: KMutex<Vec<(IfIndex, Ipv4Addr)>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.table.write().insert(ip, mac);
    }

    pub fn remove(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.table.write().remove(&ip)
    }

    /// The resolution requests issued so far, oldest first.
    pub fn requests(&self) -> Vec<(IfIndex, Ipv4Addr)> {
        self.requests.lock().clone()
    }
}

impl AddrResolver for StaticResolver {
    fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.table.read().get(&ip).copied()
    }

    fn request(&self, iface: IfIndex, ip: Ipv4Addr) {
        self.requests.lock().push((iface, ip));
    }
}

/// Packets waiting on one next hop, oldest first.
#[derive(Debug)]
pub struct PendingEntry {
    pub iface: IfIndex,
    queue: VecDeque<Packet>,
}

impl PendingEntry {
    /// Take the queued packets off the resolution queue, oldest
    /// first.
    pub fn drain(self) -> impl Iterator<Item = Packet> {
        self.queue.into_iter().map(|mut pkt| {
            pkt.dequeue();
            pkt
        })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The result of queueing a packet on a next hop.
#[derive(Debug)]
pub struct Queued {
    /// This is the first packet for the next hop; a resolution
    /// request should go out.
    pub new_entry: bool,
    /// The oldest packet, pushed out to keep the queue within its
    /// depth. It is off the resolution queue and ready to release.
    pub evicted: Option<Packet>,
}

/// Per next-hop queues of packets awaiting link address resolution.
#[derive(Debug)]
pub struct PendingTable {
    depth: usize,
    entries: BTreeMap<Ipv4Addr, PendingEntry>,
}

impl PendingTable {
    pub fn new(depth: usize) -> Self {
        Self { depth: depth.max(1), entries: BTreeMap::new() }
    }

    pub fn queue(
        &mut self,
        next_hop: Ipv4Addr,
        iface: IfIndex,
        mut pkt: Packet,
    ) -> Queued {
        let mut new_entry = false;
        let entry = self.entries.entry(next_hop).or_insert_with(|| {
            new_entry = true;
            PendingEntry { iface, queue: VecDeque::new() }
        });

        pkt.enqueue(QueueKind::ResolutionPending);
        entry.queue.push_back(pkt);

        let evicted = if entry.queue.len() > self.depth {
            entry.queue.pop_front().map(|mut old| {
                old.dequeue();
                old
            })
        } else {
            None
        };

        Queued { new_entry, evicted }
    }

    /// Remove and return the queue for `next_hop`.
    pub fn take(&mut self, next_hop: Ipv4Addr) -> Option<PendingEntry> {
        self.entries.remove(&next_hop)
    }

    pub fn is_pending(&self, next_hop: Ipv4Addr) -> bool {
        self.entries.contains_key(&next_hop)
    }

    /// The number of packets queued on `next_hop`.
    pub fn queued(&self, next_hop: Ipv4Addr) -> usize {
        self.entries.get(&next_hop).map(PendingEntry::len).unwrap_or(0)
    }

    /// The number of next hops being resolved.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
