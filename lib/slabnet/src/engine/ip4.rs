// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv4 header.
//!
//! The engine never edits header bytes in place. A header is decoded
//! once into an [`Ipv4Hdr`] value, all arithmetic (lengths, fragment
//! offsets, flags) happens on that host-order value, and it is
//! encoded again only when written in front of a packet. Byte order
//! is handled entirely by the [`Ipv4HdrRaw`] wire layout.

use super::checksum;
use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use crate::api::Ipv4Addr;
use crate::api::Protocol;
use bitflags::bitflags;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U16;

pub const IPV4_VERSION: u8 = 4;
pub const IPV4_HDR_LEN_MIN: usize = 20;
pub const IPV4_HDR_LEN_MAX: usize = 60;
pub const IPV4_MAX_LEN: usize = u16::MAX as usize;

/// Fragment offsets are carried in units of this many bytes.
pub const FRAG_ALIGN: usize = 8;
const FRAG_OFF_MASK: u16 = 0x1FFF;
const FLAGS_SHIFT: u16 = 13;

/// The largest representable fragment offset, in bytes.
pub const FRAG_OFF_MAX: usize = FRAG_OFF_MASK as usize * FRAG_ALIGN;

bitflags! {
    /// The three-bit flags field preceding the fragment offset.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Ipv4Flags: u8 {
        const RESERVED = 0b100;
        const DONT_FRAGMENT = 0b010;
        const MORE_FRAGMENTS = 0b001;
    }
}

/// The fixed part of the IPv4 header as laid out on the wire.
#[derive(
    Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct Ipv4HdrRaw {
    pub ver_ihl: u8,
    pub tos: u8,
    pub total_len: U16,
    pub ident: U16,
    pub flags_frag_off: U16,
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Ipv4HdrError {
    #[error("truncated header: only {len} bytes")]
    Truncated { len: usize },

    #[error("bad version: {0}")]
    BadVersion(u8),

    #[error("bad header length: {0}")]
    BadHdrLen(usize),

    #[error("total length {total} does not cover header length {hdr}")]
    BadTotalLen { total: u16, hdr: usize },

    #[error("datagram of {0} bytes exceeds the IPv4 maximum")]
    TooLong(usize),
}

/// A decoded IPv4 header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Hdr {
    /// Length of the header in bytes, options included.
    pub hdr_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags: Ipv4Flags,
    /// Position of this fragment's payload in the datagram, in bytes.
    pub frag_off: usize,
    pub ttl: u8,
    pub proto: Protocol,
    pub csum: HeaderChecksum,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Hdr {
    /// A header without options for a datagram carrying
    /// `payload_len` bytes.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: Protocol,
        ttl: u8,
        payload_len: usize,
    ) -> Result<Self, Ipv4HdrError> {
        let mut hdr = Self {
            hdr_len: IPV4_HDR_LEN_MIN,
            tos: 0,
            total_len: 0,
            ident: 0,
            flags: Ipv4Flags::empty(),
            frag_off: 0,
            ttl,
            proto,
            csum: HeaderChecksum::wrap([0; 2]),
            src,
            dst,
        };
        hdr.set_payload_len(payload_len)?;
        Ok(hdr)
    }

    /// Decode the header at the front of `bytes`.
    ///
    /// This checks only what is needed to find the payload: the
    /// version, a header length that fits in `bytes`, and a total
    /// length that covers the header. The checksum is left to the
    /// caller, see [`Ipv4Hdr::csum_ok`].
    pub fn parse(bytes: &[u8]) -> Result<Self, Ipv4HdrError> {
        let (raw, _) = Ipv4HdrRaw::read_from_prefix(bytes)
            .map_err(|_| Ipv4HdrError::Truncated { len: bytes.len() })?;

        let version = raw.ver_ihl >> 4;
        if version != IPV4_VERSION {
            return Err(Ipv4HdrError::BadVersion(version));
        }

        let hdr_len = usize::from(raw.ver_ihl & 0x0F) * 4;
        if hdr_len < IPV4_HDR_LEN_MIN {
            return Err(Ipv4HdrError::BadHdrLen(hdr_len));
        }

        if bytes.len() < hdr_len {
            return Err(Ipv4HdrError::Truncated { len: bytes.len() });
        }

        let total_len = raw.total_len.get();
        if usize::from(total_len) < hdr_len {
            return Err(Ipv4HdrError::BadTotalLen { total: total_len, hdr: hdr_len });
        }

        let ff = raw.flags_frag_off.get();

        Ok(Self {
            hdr_len,
            tos: raw.tos,
            total_len,
            ident: raw.ident.get(),
            flags: Ipv4Flags::from_bits_truncate((ff >> FLAGS_SHIFT) as u8),
            frag_off: usize::from(ff & FRAG_OFF_MASK) * FRAG_ALIGN,
            ttl: raw.ttl,
            proto: Protocol::from(raw.proto),
            csum: HeaderChecksum::wrap(raw.csum),
            src: Ipv4Addr::from(raw.src),
            dst: Ipv4Addr::from(raw.dst),
        })
    }

    /// Does the checksum of the encoded header in `bytes` (options
    /// included) verify?
    pub fn csum_ok(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.hdr_len && checksum::verify(&bytes[..self.hdr_len])
    }

    /// Encode this header without options.
    ///
    /// When `compute_csum` is false the checksum field is left zero
    /// for the link to fill in.
    pub fn emit(&self, compute_csum: bool) -> [u8; IPV4_HDR_LEN_MIN] {
        debug_assert!(self.frag_off % FRAG_ALIGN == 0);
        debug_assert!(self.frag_off <= FRAG_OFF_MAX);

        let frag_units = (self.frag_off / FRAG_ALIGN) as u16 & FRAG_OFF_MASK;
        let ff = (u16::from(self.flags.bits()) << FLAGS_SHIFT) | frag_units;

        let mut raw = Ipv4HdrRaw {
            ver_ihl: (IPV4_VERSION << 4) | (IPV4_HDR_LEN_MIN / 4) as u8,
            tos: self.tos,
            total_len: U16::new(self.total_len),
            ident: U16::new(self.ident),
            flags_frag_off: U16::new(ff),
            ttl: self.ttl,
            proto: u8::from(self.proto),
            csum: [0; 2],
            src: self.src.bytes(),
            dst: self.dst.bytes(),
        };

        if compute_csum {
            raw.csum =
                HeaderChecksum::from(Checksum::compute(raw.as_bytes())).bytes();
        }

        let mut out = [0u8; IPV4_HDR_LEN_MIN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Drop any options: the header is re-emitted at its minimum size.
    pub fn strip_options(&mut self) {
        let opt_len = self.hdr_len - IPV4_HDR_LEN_MIN;
        self.hdr_len = IPV4_HDR_LEN_MIN;
        self.total_len -= opt_len as u16;
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.total_len) - self.hdr_len
    }

    pub fn set_payload_len(&mut self, len: usize) -> Result<(), Ipv4HdrError> {
        let total = self.hdr_len + len;
        self.total_len =
            u16::try_from(total).map_err(|_| Ipv4HdrError::TooLong(total))?;
        Ok(())
    }

    pub fn more_frags(&self) -> bool {
        self.flags.contains(Ipv4Flags::MORE_FRAGMENTS)
    }

    pub fn dont_frag(&self) -> bool {
        self.flags.contains(Ipv4Flags::DONT_FRAGMENT)
    }

    /// Is this datagram one piece of a larger one?
    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_off != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HDR: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xB8,
        0x61, 0xC0, 0xA8, 0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
    ];

    #[test]
    fn parse_known() {
        let hdr = Ipv4Hdr::parse(&HDR).unwrap();
        assert_eq!(hdr.hdr_len, 20);
        assert_eq!(hdr.total_len, 0x73);
        assert_eq!(hdr.payload_len(), 0x73 - 20);
        assert!(hdr.dont_frag());
        assert!(!hdr.is_fragment());
        assert_eq!(hdr.ttl, 64);
        assert_eq!(hdr.proto, Protocol::Udp);
        assert_eq!(hdr.src, Ipv4Addr::from_const([192, 168, 0, 1]));
        assert_eq!(hdr.dst, Ipv4Addr::from_const([192, 168, 0, 199]));
        assert!(hdr.csum_ok(&HDR));
        assert_eq!(hdr.emit(true), HDR);
    }

    #[test]
    fn fragment_fields() {
        let mut hdr = Ipv4Hdr::new(
            Ipv4Addr::from_const([10, 0, 0, 1]),
            Ipv4Addr::from_const([10, 0, 0, 2]),
            Protocol::Udp,
            32,
            552,
        )
        .unwrap();
        hdr.ident = 0x1234;
        hdr.flags = Ipv4Flags::MORE_FRAGMENTS;
        hdr.frag_off = 1104;

        let bytes = hdr.emit(true);
        // 1104 / 8 = 138 = 0x8a, with MF in bit 13.
        assert_eq!(&bytes[6..8], &[0x20, 0x8a]);

        let back = Ipv4Hdr::parse(&bytes).unwrap();
        assert!(back.csum_ok(&bytes));
        assert!(back.more_frags());
        assert!(back.is_fragment());
        assert_eq!(back.frag_off, 1104);
        assert_eq!(back.total_len, 572);
    }

    #[test]
    fn offloaded_csum_is_zero() {
        let hdr = Ipv4Hdr::parse(&HDR).unwrap();
        let bytes = hdr.emit(false);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert!(!hdr.csum_ok(&bytes));
    }

    #[test]
    fn malformed() {
        assert_eq!(
            Ipv4Hdr::parse(&HDR[..19]),
            Err(Ipv4HdrError::Truncated { len: 19 })
        );

        let mut v6 = HDR;
        v6[0] = 0x65;
        assert_eq!(Ipv4Hdr::parse(&v6), Err(Ipv4HdrError::BadVersion(6)));

        let mut short_ihl = HDR;
        short_ihl[0] = 0x44;
        assert_eq!(Ipv4Hdr::parse(&short_ihl), Err(Ipv4HdrError::BadHdrLen(16)));

        let mut opts = HDR;
        opts[0] = 0x46;
        assert_eq!(
            Ipv4Hdr::parse(&opts),
            Err(Ipv4HdrError::Truncated { len: 20 })
        );

        let mut short_total = HDR;
        short_total[2] = 0;
        short_total[3] = 10;
        assert_eq!(
            Ipv4Hdr::parse(&short_total),
            Err(Ipv4HdrError::BadTotalLen { total: 10, hdr: 20 })
        );

        let too_long = Ipv4Hdr::new(
            Ipv4Addr::ANY_ADDR,
            Ipv4Addr::ANY_ADDR,
            Protocol::Udp,
            1,
            IPV4_MAX_LEN,
        );
        assert_eq!(too_long, Err(Ipv4HdrError::TooLong(IPV4_MAX_LEN + 20)));
    }

    #[test]
    fn options_stripped() {
        let mut bytes = [0u8; 24];
        bytes[..20].copy_from_slice(&HDR);
        bytes[0] = 0x46;
        let mut hdr = Ipv4Hdr::parse(&bytes).unwrap();
        assert_eq!(hdr.hdr_len, 24);
        let payload = hdr.payload_len();
        hdr.strip_options();
        assert_eq!(hdr.hdr_len, 20);
        assert_eq!(hdr.payload_len(), payload);
    }
}
