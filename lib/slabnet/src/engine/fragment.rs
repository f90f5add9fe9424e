// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 fragmentation.
//!
//! A datagram too large for its outgoing interface is split into
//! fragments, each a fresh packet from the stack's default pool with
//! its own copy of the header. The payload is copied out of the
//! source chain run by run, so neither the source slabs nor the
//! fragment slabs need line up with the fragment boundaries.
//!
//! Fragments go to the link as soon as each is built. If building
//! one fails, the fragments already sent stay sent; the source is
//! released and the request counted as a failure.
//!
//! A datagram that is itself a fragment (one being forwarded) can be
//! fragmented again. Each new fragment's offset is the original
//! offset plus its position within the original payload, and the
//! last one inherits the original's more-fragments flag.

use super::driver::LinkDest;
use super::iface::IfCaps;
use super::iface::Interface;
use super::ip::IpStack;
use super::ip::SendError;
use super::ip4::FRAG_ALIGN;
use super::ip4::FRAG_OFF_MAX;
use super::ip4::IPV4_HDR_LEN_MAX;
use super::ip4::IPV4_HDR_LEN_MIN;
use super::ip4::Ipv4Flags;
use super::ip4::Ipv4Hdr;
use super::packet::Packet;
use super::packet::PacketError;
use super::packet::PacketReader;
use super::pool::WaitOption;
use super::send::push_header;
use crate::provider::LogLevel;
use core::cmp;

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("MTU {0} leaves no room for fragment data")]
    MtuTooSmall(u16),

    #[error("fragment offset {0} does not fit the header")]
    OffsetOverflow(usize),
}

/// One fragment of a plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Piece {
    /// Where this fragment's data starts in the source payload.
    pub start: usize,
    pub len: usize,
    /// The offset carried in this fragment's header.
    pub frag_off: usize,
    pub more: bool,
}

/// How a datagram is to be cut up for a given MTU.
#[derive(Clone, Copy, Debug)]
pub struct FragmentPlan {
    fragment_size: usize,
    payload_len: usize,
    orig_off: usize,
    orig_more: bool,
}

impl FragmentPlan {
    pub fn new(hdr: &Ipv4Hdr, mtu: u16) -> Result<Self, PlanError> {
        let fragment_size = usize::from(mtu).saturating_sub(IPV4_HDR_LEN_MIN)
            & !(FRAG_ALIGN - 1);
        if fragment_size == 0 {
            return Err(PlanError::MtuTooSmall(mtu));
        }

        let plan = Self {
            fragment_size,
            payload_len: hdr.payload_len(),
            orig_off: hdr.frag_off,
            orig_more: hdr.more_frags(),
        };

        if let Some(last) = plan.pieces().last() {
            if last.frag_off > FRAG_OFF_MAX {
                return Err(PlanError::OffsetOverflow(last.frag_off));
            }
        }

        Ok(plan)
    }

    /// Payload bytes carried by every fragment but the last: what the
    /// MTU leaves after the header, rounded down to the fragment
    /// offset unit.
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn count(&self) -> usize {
        self.payload_len.div_ceil(self.fragment_size)
    }

    pub fn pieces(&self) -> impl Iterator<Item = Piece> + '_ {
        let count = self.count();
        (0..count).map(move |i| {
            let start = i * self.fragment_size;
            let last = i + 1 == count;
            Piece {
                start,
                len: cmp::min(self.fragment_size, self.payload_len - start),
                frag_off: self.orig_off + start,
                more: !last || self.orig_more,
            }
        })
    }
}

/// Fragment `src`, a datagram with its header in place, onto `iface`.
/// Returns the number of fragments sent.
///
/// The source is released whatever the outcome.
pub(crate) fn fragment(
    stack: &IpStack,
    src: Packet,
    iface: &Interface,
    dest: LinkDest,
) -> Result<usize, SendError> {
    stack.bump(|s| s.total_fragment_requests += 1);
    let res = send_fragments(stack, &src, iface, dest);
    drop(src);

    match res {
        Ok(n) => {
            stack.bump(|s| s.successful_fragment_requests += 1);
            Ok(n)
        }

        Err(e) => {
            stack.bump(|s| s.fragment_failures += 1);
            stack.log(
                LogLevel::Warn,
                &format!("{}: fragmentation failed: {e}", iface.name),
            );
            Err(e)
        }
    }
}

fn send_fragments(
    stack: &IpStack,
    src: &Packet,
    iface: &Interface,
    dest: LinkDest,
) -> Result<usize, SendError> {
    let mut buf = [0u8; IPV4_HDR_LEN_MAX];
    let n = src.extract_offset(0, &mut buf)?;
    let mut hdr = Ipv4Hdr::parse(&buf[..n])?;
    let plan = FragmentPlan::new(&hdr, iface.mtu)?;
    let compute_csum = !iface.caps.contains(IfCaps::TX_IPV4_CSUM);

    let mut rdr = src.reader(hdr.hdr_len);
    hdr.strip_options();

    let mut sent = 0;
    for piece in plan.pieces() {
        let frag = build(stack, &mut rdr, &hdr, piece, compute_csum)
            .map_err(|err| SendError::Fragment { sent, err })?;
        stack.transmit(frag, iface, dest)?;
        stack.bump(|s| s.total_fragments_sent += 1);
        sent += 1;
    }

    Ok(sent)
}

fn build(
    stack: &IpStack,
    rdr: &mut PacketReader<'_>,
    hdr: &Ipv4Hdr,
    piece: Piece,
    compute_csum: bool,
) -> Result<Packet, PacketError> {
    let pool = stack.pool();
    let reserve = cmp::min(stack.hdr_reserve(), pool.payload_size());
    let mut frag = pool.allocate(reserve, WaitOption::NoWait)?;

    let mut left = piece.len;
    while left > 0 {
        let Some(run) = rdr.next_run(left) else {
            return Err(PacketError::InvalidPacket {
                declared: hdr.payload_len(),
                walked: piece.start + piece.len - left,
            });
        };
        frag.append(run, pool, WaitOption::NoWait)?;
        left -= run.len();
    }

    let mut fh = *hdr;
    fh.frag_off = piece.frag_off;
    fh.flags.set(Ipv4Flags::MORE_FRAGMENTS, piece.more);
    fh.set_payload_len(piece.len)
        .map_err(|_| PacketError::InvalidParameter(piece.len))?;
    push_header(&mut frag, &fh, stack.hdr_reserve(), compute_csum)?;
    Ok(frag)
}
