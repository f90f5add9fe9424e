// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv4 receive path: validate, deliver locally, reassemble, or
//! forward.
//!
//! Receive never hands a packet back to its caller. Anything that
//! cannot be delivered or forwarded is released and counted, and the
//! returned error only says why.

use super::iface::IfCaps;
use super::iface::IfIndex;
use super::iface::Interface;
use super::ip::IpStack;
use super::ip::SendError;
use super::ip4::IPV4_HDR_LEN_MAX;
use super::ip4::Ipv4Hdr;
use super::ip4::Ipv4HdrError;
use super::packet::Packet;
use super::reassembly::Reassembly;
use super::send::push_header;
use crate::api::Ipv4Addr;
use crate::api::Protocol;
use crate::provider::LogLevel;
use crate::sys::time::Instant;

/// What became of a received datagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Handed to the protocol handler.
    Delivered,
    /// A fragment, held until the rest of its datagram arrives.
    Held,
    Forwarded,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RecvError {
    #[error("no interface {0}")]
    UnknownIface(IfIndex),

    #[error("malformed header: {0}")]
    Malformed(#[from] Ipv4HdrError),

    #[error("chain holds {len} bytes but the header claims {total}")]
    Truncated { total: usize, len: usize },

    #[error("header checksum does not verify")]
    Checksum,

    #[error("{0} is not a local address")]
    NotLocal(Ipv4Addr),

    #[error("no handler for protocol {0}")]
    UnknownProtocol(Protocol),

    #[error("fragment received with reassembly disabled")]
    ReassemblyDisabled,

    #[error("fragment overlaps its datagram")]
    FragmentDropped,

    #[error("TTL expired in transit")]
    TtlExpired,

    #[error("forward: {0}")]
    Forward(#[from] SendError),
}

impl RecvError {
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownIface(_) => 0x4D,
            Self::Malformed(_)
            | Self::Truncated { .. }
            | Self::Checksum
            | Self::FragmentDropped => 0x12,
            Self::NotLocal(_) | Self::TtlExpired => 0x21,
            Self::UnknownProtocol(_) | Self::ReassemblyDisabled => 0x14,
            Self::Forward(e) => e.code(),
        }
    }
}

impl IpStack {
    /// Process a datagram the link driver received on `iface`.
    pub fn packet_receive(
        &self,
        mut pkt: Packet,
        iface: IfIndex,
    ) -> Result<Delivery, RecvError> {
        self.bump(|s| s.total_packets_received += 1);

        let Some(ifc) = self.iface(iface) else {
            self.bump(|s| s.receive_packets_dropped += 1);
            return Err(RecvError::UnknownIface(iface));
        };

        let mut buf = [0u8; IPV4_HDR_LEN_MAX];
        let n = pkt.extract_offset(0, &mut buf).unwrap_or(0);
        let mut hdr = match Ipv4Hdr::parse(&buf[..n]) {
            Ok(hdr) if usize::from(hdr.total_len) > hdr.hdr_len => hdr,
            Ok(hdr) => {
                self.bump(|s| s.invalid_packets += 1);
                return Err(RecvError::Malformed(Ipv4HdrError::BadTotalLen {
                    total: hdr.total_len,
                    hdr: hdr.hdr_len,
                }));
            }
            Err(e) => {
                self.bump(|s| s.invalid_packets += 1);
                return Err(e.into());
            }
        };

        let total = usize::from(hdr.total_len);
        if pkt.len() < total {
            self.bump(|s| s.invalid_packets += 1);
            return Err(RecvError::Truncated { total, len: pkt.len() });
        }

        // Anything past the datagram is link padding.
        pkt.truncate(total);

        if !ifc.caps.contains(IfCaps::RX_IPV4_CSUM) && !hdr.csum_ok(&buf[..n]) {
            self.bump(|s| s.receive_checksum_errors += 1);
            return Err(RecvError::Checksum);
        }

        self.bump(|s| s.total_bytes_received += total as u64);

        if pkt.trim_front(hdr.hdr_len).is_err() {
            self.bump(|s| s.invalid_packets += 1);
            return Err(RecvError::Truncated { total, len: pkt.len() });
        }
        hdr.strip_options();

        if self.is_local(ifc, hdr.dst) {
            return self.deliver(hdr, ifc.index, pkt);
        }

        if self.cfg.forwarding && !hdr.dst.is_multicast() {
            return self.forward(hdr, pkt);
        }

        self.bump(|s| s.invalid_receive_address += 1);
        Err(RecvError::NotLocal(hdr.dst))
    }

    /// Is `dst` addressed to this host, as received on `ifc`?
    pub(crate) fn is_local(&self, ifc: &Interface, dst: Ipv4Addr) -> bool {
        dst == Ipv4Addr::ANY_ADDR
            || dst.is_loopback()
            || ifc.is_bcast(dst)
            || self.iface_by_addr(dst).is_some()
            || (dst.is_multicast() && self.is_member(dst))
    }

    fn deliver(
        &self,
        hdr: Ipv4Hdr,
        iface: IfIndex,
        pkt: Packet,
    ) -> Result<Delivery, RecvError> {
        if !hdr.is_fragment() {
            return self.dispatch(hdr, iface, pkt);
        }

        if !self.cfg.reassembly {
            self.bump(|s| s.receive_packets_dropped += 1);
            return Err(RecvError::ReassemblyDisabled);
        }

        self.bump(|s| s.total_fragments_received += 1);
        let ins = self.reasm.lock().insert(&hdr, pkt, Instant::now());
        if ins.evicted {
            self.bump(|s| s.reassembly_failures += 1);
        }

        match ins.result {
            Reassembly::Complete(hdr, pkt) => {
                self.bump(|s| s.packets_reassembled += 1);
                self.dispatch(hdr, iface, pkt)
            }

            Reassembly::Held => Ok(Delivery::Held),

            Reassembly::Dropped => {
                self.bump(|s| s.reassembly_failures += 1);
                Err(RecvError::FragmentDropped)
            }
        }
    }

    fn dispatch(
        &self,
        hdr: Ipv4Hdr,
        iface: IfIndex,
        pkt: Packet,
    ) -> Result<Delivery, RecvError> {
        let Some(handler) = self.handler(hdr.proto) else {
            self.bump(|s| s.unknown_protocols_received += 1);
            self.log(
                LogLevel::Note,
                &format!("{}: no handler for protocol {}", self.name(), hdr.proto),
            );
            return Err(RecvError::UnknownProtocol(hdr.proto));
        };

        self.bump(|s| s.total_packets_delivered += 1);
        handler.receive(&hdr, iface, pkt);
        Ok(Delivery::Delivered)
    }

    fn forward(
        &self,
        mut hdr: Ipv4Hdr,
        mut pkt: Packet,
    ) -> Result<Delivery, RecvError> {
        if hdr.ttl <= 1 {
            self.bump(|s| s.receive_packets_dropped += 1);
            return Err(RecvError::TtlExpired);
        }
        hdr.ttl -= 1;

        let Some(route) = self.route(hdr.dst) else {
            self.bump(|s| s.transmit_no_route_errors += 1);
            return Err(SendError::NoRoute(hdr.dst).into());
        };

        let csum = !route.iface.caps.contains(IfCaps::TX_IPV4_CSUM);
        if let Err(e) = push_header(&mut pkt, &hdr, self.hdr_reserve(), csum) {
            self.bump(|s| s.transmit_resource_errors += 1);
            return Err(SendError::from(e).into());
        }

        self.output(pkt, &hdr, route)?;
        self.bump(|s| s.packets_forwarded += 1);
        Ok(Delivery::Forwarded)
    }

    /// Drop every partly reassembled datagram whose time is up.
    /// Returns the number dropped.
    pub fn reassembly_expire(&self, now: Instant) -> usize {
        let n = self.reasm.lock().expire(now);
        if n > 0 {
            self.bump(|s| s.reassembly_failures += n as u64);
            self.log(
                LogLevel::Note,
                &format!("{}: {n} reassemblies timed out", self.name()),
            );
        }
        n
    }
}
