// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv4 send path.
//!
//! Every packet that enters [`IpStack::packet_send()`] leaves it in
//! exactly one way: handed to the link driver, handed to the
//! fragmentation engine, parked on a resolution queue, or released.
//! Loopback and multicast loopback deliveries are deep copies, so a
//! packet is never on the local receive path and the link at once.

use super::driver::DriverCommand;
use super::driver::DriverRequest;
use super::driver::LinkDest;
use super::fragment;
use super::iface::IfCaps;
use super::iface::Interface;
use super::ip::IpStack;
use super::ip::SendError;
use super::ip4::IPV4_HDR_LEN_MIN;
use super::ip4::Ipv4Flags;
use super::ip4::Ipv4Hdr;
use super::packet::Packet;
use super::packet::PacketError;
use super::pool::WaitOption;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::Protocol;
use crate::provider::LogLevel;

/// How to address a datagram handed to [`IpStack::packet_send()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SendParams {
    pub dst: Ipv4Addr,
    pub proto: Protocol,
    /// Falls back to the stack's default TTL.
    pub ttl: Option<u8>,
    pub tos: u8,
    pub dont_frag: bool,
}

impl SendParams {
    pub fn new(dst: Ipv4Addr, proto: Protocol) -> Self {
        Self { dst, proto, ttl: None, tos: 0, dont_frag: false }
    }
}

/// Where the send path decided a datagram should go.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Route<'a> {
    pub iface: &'a Interface,
    pub next_hop: Ipv4Addr,
}

impl IpStack {
    /// Send `pkt`, which holds an upper-layer datagram, to
    /// `params.dst`.
    ///
    /// The IP header is built here and prepended to the first slab.
    /// A datagram that is queued awaiting address resolution counts
    /// as sent; its fate is settled by
    /// [`IpStack::resolution_complete()`] or
    /// [`IpStack::resolution_failed()`].
    pub fn packet_send(
        &self,
        mut pkt: Packet,
        params: SendParams,
    ) -> Result<(), SendError> {
        self.bump(|s| s.total_packet_send_requests += 1);

        let dst = params.dst;
        let local = dst.is_loopback() || self.iface_by_addr(dst).is_some();

        let route = if dst.is_loopback() {
            self.ifaces.first().map(|iface| Route { iface, next_hop: dst })
        } else {
            self.route(dst)
        };

        let Some(route) = route else {
            self.bump(|s| s.transmit_no_route_errors += 1);
            return Err(SendError::NoRoute(dst));
        };

        let ttl = params.ttl.unwrap_or(self.cfg.default_ttl);
        let mut hdr = match Ipv4Hdr::new(
            route.iface.ip,
            dst,
            params.proto,
            ttl,
            pkt.len(),
        ) {
            Ok(hdr) => hdr,
            Err(e) => {
                self.bump(|s| s.invalid_transmit_packets += 1);
                return Err(e.into());
            }
        };
        hdr.tos = params.tos;
        hdr.ident = self.next_ident();
        hdr.flags.set(Ipv4Flags::DONT_FRAGMENT, params.dont_frag);

        // A local delivery is checked on receive, so it always
        // carries a real checksum.
        let csum = local || !route.iface.caps.contains(IfCaps::TX_IPV4_CSUM);
        if let Err(e) = push_header(&mut pkt, &hdr, self.hdr_reserve(), csum) {
            self.bump(|s| s.transmit_resource_errors += 1);
            return Err(e.into());
        }

        if local {
            return self.loopback(pkt, route.iface);
        }

        if dst.is_multicast()
            && self.cfg.multicast_loopback
            && self.is_member(dst)
        {
            self.loop_copy(&pkt, route.iface);
        }

        self.output(pkt, &hdr, route)
    }

    /// Pick the outgoing interface and next hop for `dst`.
    pub(crate) fn route(&self, dst: Ipv4Addr) -> Option<Route<'_>> {
        if dst.is_limited_bcast() || dst.is_multicast() {
            let iface = self.ifaces.first()?;
            return Some(Route { iface, next_hop: dst });
        }

        if let Some(iface) = self.ifaces.iter().find(|i| i.is_on_link(dst)) {
            return Some(Route { iface, next_hop: dst });
        }

        let gw = self.cfg.gateway?;
        self.ifaces
            .iter()
            .find(|i| i.is_on_link(gw))
            .map(|iface| Route { iface, next_hop: gw })
    }

    /// The link address for a datagram to `dst` through `next_hop`,
    /// or `None` if it has yet to be resolved.
    pub(crate) fn link_dest(
        &self,
        iface: &Interface,
        dst: Ipv4Addr,
        next_hop: Ipv4Addr,
    ) -> Option<LinkDest> {
        if !iface.caps.contains(IfCaps::NEEDS_RESOLUTION) {
            return Some(LinkDest::None);
        }

        if iface.is_bcast(dst) {
            return Some(LinkDest::Broadcast);
        }

        if dst.is_multicast() {
            return Some(LinkDest::Multicast(MacAddr::from_ipv4_mcast(dst)));
        }

        self.resolver.lookup(next_hop).map(LinkDest::Unicast)
    }

    fn loopback(&self, pkt: Packet, iface: &Interface) -> Result<(), SendError> {
        let copy = pkt.duplicate(&self.pool, WaitOption::NoWait);
        drop(pkt);

        match copy {
            Ok(copy) => {
                self.bump(|s| s.total_packets_sent += 1);
                // The receive side does its own accounting.
                let _ = self.packet_receive(copy, iface.index);
                Ok(())
            }

            Err(e) => {
                self.bump(|s| s.transmit_resource_errors += 1);
                Err(e.into())
            }
        }
    }

    fn loop_copy(&self, pkt: &Packet, iface: &Interface) {
        match pkt.duplicate(&self.pool, WaitOption::NoWait) {
            Ok(copy) => {
                let _ = self.packet_receive(copy, iface.index);
            }

            Err(_) => self.bump(|s| s.transmit_resource_errors += 1),
        }
    }

    /// Send a datagram whose header is already in place at the front
    /// of `pkt`.
    ///
    /// An oversized datagram that may not be fragmented is dropped
    /// here, before it can wait on resolution. Otherwise it is sent,
    /// fragmented, or queued on its next hop.
    pub(crate) fn output(
        &self,
        pkt: Packet,
        hdr: &Ipv4Hdr,
        route: Route<'_>,
    ) -> Result<(), SendError> {
        let iface = route.iface;
        let len = pkt.len();

        let too_big = len > usize::from(iface.mtu);
        if too_big && (!self.cfg.fragmentation || hdr.dont_frag()) {
            self.bump(|s| s.send_packets_dropped += 1);
            self.log(
                LogLevel::Warn,
                &format!(
                    "{}: dropped {len} byte datagram to {}: MTU {}",
                    iface.name, hdr.dst, iface.mtu
                ),
            );
            return Err(SendError::CannotFragment { len, mtu: iface.mtu });
        }

        match self.link_dest(iface, hdr.dst, route.next_hop) {
            Some(dest) => self.emit(pkt, iface, dest),
            None => {
                self.pend(pkt, iface, route.next_hop);
                Ok(())
            }
        }
    }

    /// Put a framed datagram on the link, fragmenting it first if it
    /// exceeds the MTU.
    pub(crate) fn emit(
        &self,
        pkt: Packet,
        iface: &Interface,
        dest: LinkDest,
    ) -> Result<(), SendError> {
        if pkt.len() > usize::from(iface.mtu) {
            return fragment::fragment(self, pkt, iface, dest).map(|_| ());
        }

        self.transmit(pkt, iface, dest)
    }

    /// Hand one frame to the link driver.
    pub(crate) fn transmit(
        &self,
        pkt: Packet,
        iface: &Interface,
        dest: LinkDest,
    ) -> Result<(), SendError> {
        let len = pkt.len() as u64;
        let command = match dest {
            LinkDest::Broadcast => DriverCommand::PacketBroadcast,
            _ => DriverCommand::PacketSend,
        };

        let req = DriverRequest { command, iface: iface.index, pkt, dest };
        match self.driver.request(req) {
            Ok(()) => {
                self.bump(|s| {
                    s.total_packets_sent += 1;
                    s.total_bytes_sent += len;
                });
                Ok(())
            }

            Err(e) => {
                self.bump(|s| s.send_packets_dropped += 1);
                Err(e.into())
            }
        }
    }

    fn pend(&self, pkt: Packet, iface: &Interface, next_hop: Ipv4Addr) {
        let queued = self.pending.lock().queue(next_hop, iface.index, pkt);

        if queued.new_entry {
            self.resolver.request(iface.index, next_hop);
        }

        if let Some(old) = queued.evicted {
            drop(old);
            self.bump(|s| s.resolution_queue_drops += 1);
            self.log(
                LogLevel::Warn,
                &format!("{}: resolution queue for {next_hop} full", iface.name),
            );
        }
    }

    /// `next_hop` resolved to `mac`: send everything waiting on it,
    /// oldest first. Returns the number of datagrams drained.
    pub fn resolution_complete(&self, next_hop: Ipv4Addr, mac: MacAddr) -> usize {
        let Some(entry) = self.pending.lock().take(next_hop) else {
            return 0;
        };

        let Some(iface) = self.iface(entry.iface) else {
            return 0;
        };

        let mut n = 0;
        for pkt in entry.drain() {
            n += 1;
            let dest = match Ipv4Hdr::parse(&head_bytes(&pkt)) {
                Ok(hdr) if iface.is_bcast(hdr.dst) => LinkDest::Broadcast,
                _ => LinkDest::Unicast(mac),
            };
            // Failures are counted on the way down.
            let _ = self.emit(pkt, iface, dest);
        }
        n
    }

    /// Resolution of `next_hop` failed: drop everything waiting on
    /// it. Returns the number of datagrams dropped.
    pub fn resolution_failed(&self, next_hop: Ipv4Addr) -> usize {
        let Some(entry) = self.pending.lock().take(next_hop) else {
            return 0;
        };

        let n = entry.len();
        drop(entry);
        self.bump(|s| s.send_packets_dropped += n as u64);
        n
    }

    /// The number of datagrams waiting on `next_hop`.
    pub fn pending(&self, next_hop: Ipv4Addr) -> usize {
        self.pending.lock().queued(next_hop)
    }
}

/// The first bytes of a packet, enough to decode an IPv4 header.
fn head_bytes(pkt: &Packet) -> [u8; IPV4_HDR_LEN_MIN] {
    let mut buf = [0u8; IPV4_HDR_LEN_MIN];
    let _ = pkt.extract_offset(0, &mut buf);
    buf
}

/// Emit `hdr` in front of the data, first making sure the first slab
/// has `reserve` bytes of head room.
pub(crate) fn push_header(
    pkt: &mut Packet,
    hdr: &Ipv4Hdr,
    reserve: usize,
    compute_csum: bool,
) -> Result<(), PacketError> {
    let reserve = reserve.min(pkt.pool().payload_size()).max(IPV4_HDR_LEN_MIN);
    pkt.adjust(reserve)?;
    pkt.prepend(&hdr.emit(compute_csum))
}
