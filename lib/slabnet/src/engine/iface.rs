// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 interfaces attached to a stack.

use crate::api::IPV4_MIN_MTU;
use crate::api::IfaceCfg;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::MacAddr;
use alloc::string::String;
use bitflags::bitflags;
use core::fmt;

/// The position of an interface within its stack.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IfIndex(pub u16);

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

bitflags! {
    /// What an interface's link driver does on the stack's behalf.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IfCaps: u32 {
        /// The driver fills in the IPv4 header checksum on transmit.
        const TX_IPV4_CSUM = 1 << 0;
        /// The driver has already verified the IPv4 header checksum
        /// of received packets.
        const RX_IPV4_CSUM = 1 << 1;
        /// Unicast transmit needs a resolved link address.
        const NEEDS_RESOLUTION = 1 << 2;
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum IfaceError {
    #[error("{name}: MTU {mtu} is below the IPv4 minimum")]
    MtuTooSmall { name: String, mtu: u16 },

    #[error("{name}: address {ip} is not within {cidr}")]
    AddrNotInSubnet { name: String, ip: Ipv4Addr, cidr: Ipv4Cidr },

    #[error("too many interfaces")]
    TooMany,
}

#[derive(Clone, Debug)]
pub struct Interface {
    pub index: IfIndex,
    pub name: String,
    pub ip: Ipv4Addr,
    pub cidr: Ipv4Cidr,
    pub mtu: u16,
    pub mac: MacAddr,
    pub caps: IfCaps,
}

impl Interface {
    pub fn from_cfg(index: IfIndex, cfg: &IfaceCfg) -> Result<Self, IfaceError> {
        if cfg.mtu < IPV4_MIN_MTU {
            return Err(IfaceError::MtuTooSmall {
                name: cfg.name.clone(),
                mtu: cfg.mtu,
            });
        }

        if !cfg.cidr.is_member(cfg.ip) {
            return Err(IfaceError::AddrNotInSubnet {
                name: cfg.name.clone(),
                ip: cfg.ip,
                cidr: cfg.cidr,
            });
        }

        let mut caps = IfCaps::empty();
        caps.set(IfCaps::TX_IPV4_CSUM, cfg.tx_csum_offload);
        caps.set(IfCaps::RX_IPV4_CSUM, cfg.rx_csum_offload);
        caps.set(IfCaps::NEEDS_RESOLUTION, cfg.needs_resolution);

        Ok(Self {
            index,
            name: cfg.name.clone(),
            ip: cfg.ip,
            cidr: cfg.cidr,
            mtu: cfg.mtu,
            mac: cfg.mac,
            caps,
        })
    }

    /// Is `ip` directly reachable on this interface's subnet?
    pub fn is_on_link(&self, ip: Ipv4Addr) -> bool {
        self.cidr.is_member(ip)
    }

    pub fn directed_bcast(&self) -> Ipv4Addr {
        self.cidr.broadcast()
    }

    /// Is `ip` a broadcast address as seen from this interface?
    pub fn is_bcast(&self, ip: Ipv4Addr) -> bool {
        ip.is_limited_bcast() || ip == self.directed_bcast()
    }
}
