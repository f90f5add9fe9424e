// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Stack configuration.
//!
//! Everything here is supplied by the surrounding system; the engine
//! never derives these values itself. Every field carries a default
//! so that a minimal configuration naming a single interface is
//! valid.

use super::ip::Ipv4Addr;
use super::ip::Ipv4Cidr;
use super::mac::MacAddr;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// The smallest MTU an IPv4 interface may carry (RFC 791).
pub const IPV4_MIN_MTU: u16 = 68;

/// The default time-to-live for locally originated datagrams.
pub const DEFAULT_TTL: u8 = 0x80;

/// The number of packets that may wait on a single unresolved
/// next-hop.
pub const DEFAULT_RESOLUTION_QUEUE_DEPTH: usize = 4;

/// Seconds a partially reassembled datagram is held.
pub const DEFAULT_REASSEMBLY_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_MAX_REASSEMBLIES: usize = 16;

/// Bytes reserved in front of every packet the stack allocates, so
/// the link driver can prepend its own header without moving data.
pub const DEFAULT_LINK_HDR_RESERVE: usize = 16;

/// A packet pool to create at stack start.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolCfg {
    #[serde(default = "PoolCfg::default_name")]
    pub name: String,
    #[serde(default = "PoolCfg::default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "PoolCfg::default_count")]
    pub count: usize,
}

impl PoolCfg {
    fn default_name() -> String {
        String::from("default")
    }

    fn default_payload_size() -> usize {
        1536
    }

    fn default_count() -> usize {
        64
    }
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            payload_size: Self::default_payload_size(),
            count: Self::default_count(),
        }
    }
}

/// A single IPv4 interface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IfaceCfg {
    pub name: String,
    pub ip: Ipv4Addr,
    pub cidr: Ipv4Cidr,
    #[serde(default = "IfaceCfg::default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub mac: MacAddr,
    /// The driver fills in the IPv4 header checksum on transmit.
    #[serde(default)]
    pub tx_csum_offload: bool,
    /// The driver has verified the IPv4 header checksum on receive.
    #[serde(default)]
    pub rx_csum_offload: bool,
    /// The link needs next-hop address resolution before unicast
    /// transmit. Point-to-point and loopback links do not.
    #[serde(default = "IfaceCfg::default_needs_resolution")]
    pub needs_resolution: bool,
}

impl IfaceCfg {
    fn default_mtu() -> u16 {
        1500
    }

    fn default_needs_resolution() -> bool {
        true
    }
}

/// The complete configuration of an IPv4 stack instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StackCfg {
    #[serde(default = "StackCfg::default_name")]
    pub name: String,
    #[serde(default)]
    pub default_pool: PoolCfg,
    pub ifaces: Vec<IfaceCfg>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default = "StackCfg::default_ttl")]
    pub default_ttl: u8,
    #[serde(default = "StackCfg::default_true")]
    pub fragmentation: bool,
    #[serde(default)]
    pub forwarding: bool,
    #[serde(default = "StackCfg::default_true")]
    pub reassembly: bool,
    /// Deliver a copy of locally sent multicast to joined groups.
    #[serde(default = "StackCfg::default_true")]
    pub multicast_loopback: bool,
    #[serde(default = "StackCfg::default_resolution_queue_depth")]
    pub resolution_queue_depth: usize,
    #[serde(default = "StackCfg::default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,
    #[serde(default = "StackCfg::default_max_reassemblies")]
    pub max_reassemblies: usize,
    #[serde(default = "StackCfg::default_link_hdr_reserve")]
    pub link_hdr_reserve: usize,
}

impl StackCfg {
    fn default_name() -> String {
        String::from("ip0")
    }

    fn default_ttl() -> u8 {
        DEFAULT_TTL
    }

    fn default_true() -> bool {
        true
    }

    fn default_resolution_queue_depth() -> usize {
        DEFAULT_RESOLUTION_QUEUE_DEPTH
    }

    fn default_reassembly_timeout_secs() -> u64 {
        DEFAULT_REASSEMBLY_TIMEOUT_SECS
    }

    fn default_max_reassemblies() -> usize {
        DEFAULT_MAX_REASSEMBLIES
    }

    fn default_link_hdr_reserve() -> usize {
        DEFAULT_LINK_HDR_RESERVE
    }

    /// A configuration with a single interface and every other
    /// value defaulted.
    pub fn single(iface: IfaceCfg) -> Self {
        Self {
            name: Self::default_name(),
            default_pool: PoolCfg::default(),
            ifaces: vec![iface],
            gateway: None,
            default_ttl: DEFAULT_TTL,
            fragmentation: true,
            forwarding: false,
            reassembly: true,
            multicast_loopback: true,
            resolution_queue_depth: DEFAULT_RESOLUTION_QUEUE_DEPTH,
            reassembly_timeout_secs: DEFAULT_REASSEMBLY_TIMEOUT_SECS,
            max_reassemblies: DEFAULT_MAX_REASSEMBLIES,
            link_hdr_reserve: DEFAULT_LINK_HDR_RESERVE,
        }
    }
}
