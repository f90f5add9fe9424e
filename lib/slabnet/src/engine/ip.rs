// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An IPv4 stack instance.
//!
//! The [`IpStack`] ties together the pieces of the datapath: the
//! default packet pool, the interfaces, the link driver, address
//! resolution, reassembly and the upper-layer protocol handlers. The
//! send side lives in [`super::send`] and [`super::fragment`], the
//! receive side in [`super::receive`].
//!
//! # Locking
//!
//! Each piece of mutable state has its own lock, and none is ever
//! held across a call into the link driver, the resolver or a
//! protocol handler. Those calls may come straight back into the
//! stack (a loopback delivery, a handler that replies, a forwarded
//! packet).

use super::driver::DriverError;
use super::driver::LinkDriver;
use super::fragment::PlanError;
use super::iface::IfIndex;
use super::iface::IfaceError;
use super::iface::Interface;
use super::ip4::IPV4_HDR_LEN_MIN;
use super::ip4::Ipv4Hdr;
use super::ip4::Ipv4HdrError;
use super::packet::Packet;
use super::packet::PacketError;
use super::pool::PacketPool;
use super::pool::PoolError;
use super::pool::WaitOption;
use super::reassembly::Reassembler;
use super::resolve::AddrResolver;
use super::resolve::PendingTable;
use crate::api::Ipv4Addr;
use crate::api::Protocol;
use crate::api::StackCfg;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use crate::sys::kstat;
use crate::sys::kstat::KStatNamed;
use crate::sys::kstat::KStatProvider;
use crate::sys::kstat::KStatU64;
use crate::sys::sync::KMutex;
use crate::sys::sync::KRwLock;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU16;
use core::sync::atomic::Ordering;
use core::time::Duration;
use kstat_macro::KStatProvider;

/// The all-hosts group, which every multicast-capable host belongs to.
pub const ALL_HOSTS: Ipv4Addr = Ipv4Addr::from_const([224, 0, 0, 1]);

#[derive(KStatProvider)]
pub struct IpStats {
    pub total_packet_send_requests: KStatU64,
    pub total_packets_sent: KStatU64,
    pub total_bytes_sent: KStatU64,
    pub total_packets_received: KStatU64,
    pub total_packets_delivered: KStatU64,
    pub total_bytes_received: KStatU64,
    pub packets_forwarded: KStatU64,
    pub packets_reassembled: KStatU64,
    pub reassembly_failures: KStatU64,
    /// Received datagrams that were truncated or had a bad header.
    pub invalid_packets: KStatU64,
    /// Datagrams handed to send that could not be framed.
    pub invalid_transmit_packets: KStatU64,
    /// Received datagrams neither for us nor forwardable.
    pub invalid_receive_address: KStatU64,
    pub unknown_protocols_received: KStatU64,
    /// Sends that failed for lack of a packet.
    pub transmit_resource_errors: KStatU64,
    pub transmit_no_route_errors: KStatU64,
    pub receive_packets_dropped: KStatU64,
    pub receive_checksum_errors: KStatU64,
    /// Sends dropped by policy, by the driver or by a failed
    /// resolution.
    pub send_packets_dropped: KStatU64,
    /// Packets evicted from a full resolution queue.
    pub resolution_queue_drops: KStatU64,
    pub total_fragment_requests: KStatU64,
    pub successful_fragment_requests: KStatU64,
    pub fragment_failures: KStatU64,
    pub total_fragments_sent: KStatU64,
    pub total_fragments_received: KStatU64,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StackError {
    #[error("a stack needs at least one interface")]
    NoInterfaces,

    #[error(transparent)]
    Iface(#[from] IfaceError),

    #[error("default pool: {0}")]
    Pool(#[from] PoolError),

    #[error("stats: {0}")]
    Stats(String),

    #[error("{0} is not a multicast group")]
    NotMulticast(Ipv4Addr),

    #[error("group {0} was not joined")]
    NotJoined(Ipv4Addr),
}

impl From<kstat::Error> for StackError {
    fn from(e: kstat::Error) -> Self {
        Self::Stats(e.to_string())
    }
}

impl StackError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Pool(e) => e.code(),
            Self::NotMulticast(_) | Self::NotJoined(_) => 0x21,
            Self::NoInterfaces | Self::Iface(_) | Self::Stats(_) => 0x4D,
        }
    }
}

/// Why a send did not reach the link.
///
/// In every case the packet has been released.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("bad header: {0}")]
    Header(#[from] Ipv4HdrError),

    #[error("{len} byte datagram exceeds MTU {mtu} and may not be fragmented")]
    CannotFragment { len: usize, mtu: u16 },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("fragmentation failed after {sent} fragments: {err}")]
    Fragment { sent: usize, err: PacketError },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl SendError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Packet(e) | Self::Fragment { err: e, .. } => e.code(),
            Self::NoRoute(_) => 0x21,
            Self::Header(_) => 0x12,
            Self::CannotFragment { .. } => 0x14,
            Self::Plan(_) => 0x4D,
            Self::Driver(e) => e.code(),
        }
    }
}

/// An upper-layer protocol (ICMP, UDP, TCP) registered with the stack.
pub trait ProtocolHandler: Send + Sync {
    /// Take delivery of a datagram. `pkt` holds the payload only;
    /// `hdr` is the IP header it arrived with, options removed.
    fn receive(&self, hdr: &Ipv4Hdr, iface: IfIndex, pkt: Packet);
}

pub struct IpStack {
    pub(crate) cfg: StackCfg,
    pub(crate) pool: PacketPool,
    pub(crate) ifaces: Vec<Interface>,
    ident: AtomicU16,
    pub(crate) pending: KMutex<PendingTable>,
    pub(crate) reasm: KMutex<Reassembler>,
    stats: KMutex<KStatNamed<IpStats>>,
    pub(crate) driver: Arc<dyn LinkDriver>,
    pub(crate) resolver: Arc<dyn AddrResolver>,
    handlers: KRwLock<BTreeMap<u8, Arc<dyn ProtocolHandler>>>,
    groups: KRwLock<BTreeSet<Ipv4Addr>>,
    log: Box<dyn LogProvider>,
}

impl IpStack {
    /// Stand up a stack: create its default pool and bring up every
    /// configured interface.
    pub fn new(
        cfg: StackCfg,
        driver: Arc<dyn LinkDriver>,
        resolver: Arc<dyn AddrResolver>,
        providers: Providers,
    ) -> Result<Self, StackError> {
        let pool = PacketPool::with_capacity(
            &cfg.default_pool.name,
            cfg.default_pool.payload_size,
            cfg.default_pool.count,
        )?;
        Self::with_pool(cfg, pool, driver, resolver, providers)
    }

    /// Stand up a stack over an existing default pool.
    pub fn with_pool(
        cfg: StackCfg,
        pool: PacketPool,
        driver: Arc<dyn LinkDriver>,
        resolver: Arc<dyn AddrResolver>,
        providers: Providers,
    ) -> Result<Self, StackError> {
        if cfg.ifaces.is_empty() {
            return Err(StackError::NoInterfaces);
        }

        let ifaces = cfg
            .ifaces
            .iter()
            .enumerate()
            .map(|(i, ic)| {
                let idx = u16::try_from(i).map_err(|_| IfaceError::TooMany)?;
                Interface::from_cfg(IfIndex(idx), ic)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stats = KStatNamed::new("slabnet", &cfg.name, IpStats::new())?;
        let pending = PendingTable::new(cfg.resolution_queue_depth);
        let reasm = Reassembler::new(
            Duration::from_secs(cfg.reassembly_timeout_secs),
            cfg.max_reassemblies,
        );

        Ok(Self {
            cfg,
            pool,
            ifaces,
            ident: AtomicU16::new(0),
            pending: KMutex::new(pending),
            reasm: KMutex::new(reasm),
            stats: KMutex::new(stats),
            driver,
            resolver,
            handlers: KRwLock::new(BTreeMap::new()),
            groups: KRwLock::new(BTreeSet::new()),
            log: providers.log,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn cfg(&self) -> &StackCfg {
        &self.cfg
    }

    /// The pool the stack allocates from: fragments, loopback
    /// copies and header slabs.
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn ifaces(&self) -> &[Interface] {
        &self.ifaces
    }

    pub fn iface(&self, idx: IfIndex) -> Option<&Interface> {
        self.ifaces.get(usize::from(idx.0))
    }

    /// Allocate a packet with room in front for the IP header and the
    /// link header.
    pub fn alloc_packet(&self, wait: WaitOption) -> Result<Packet, PoolError> {
        self.pool.allocate(self.hdr_reserve(), wait)
    }

    pub(crate) fn hdr_reserve(&self) -> usize {
        self.cfg.link_hdr_reserve + IPV4_HDR_LEN_MIN
    }

    pub(crate) fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Route incoming datagrams carrying `proto` to `handler`,
    /// returning the handler it replaces.
    pub fn register_protocol(
        &self,
        proto: Protocol,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.write().insert(u8::from(proto), handler)
    }

    pub fn unregister_protocol(
        &self,
        proto: Protocol,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.write().remove(&u8::from(proto))
    }

    pub(crate) fn handler(&self, proto: Protocol) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.read().get(&u8::from(proto)).cloned()
    }

    pub fn multicast_join(&self, group: Ipv4Addr) -> Result<(), StackError> {
        if !group.is_multicast() {
            return Err(StackError::NotMulticast(group));
        }

        self.groups.write().insert(group);
        Ok(())
    }

    pub fn multicast_leave(&self, group: Ipv4Addr) -> Result<(), StackError> {
        if self.groups.write().remove(&group) {
            Ok(())
        } else {
            Err(StackError::NotJoined(group))
        }
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        group == ALL_HOSTS || self.groups.read().contains(&group)
    }

    /// The interface that owns `ip`, if any.
    pub(crate) fn iface_by_addr(&self, ip: Ipv4Addr) -> Option<&Interface> {
        self.ifaces.iter().find(|ifc| ifc.ip == ip)
    }

    pub(crate) fn bump<F>(&self, f: F)
    where
        F: FnOnce(&mut IpStats),
    {
        f(&mut self.stats.lock().vals)
    }

    pub fn stats(&self) -> IpStatsSnap {
        self.stats.lock().vals.snapshot()
    }

    /// Delete the default pool, failing every allocation still
    /// waiting on it. Returns the number of waiters woken.
    pub fn shutdown(&self) -> Result<usize, PoolError> {
        let woken = self.pool.delete()?;
        self.log(
            LogLevel::Note,
            &format!(
                "{}: pool {} deleted, {woken} waiters woken",
                self.name(),
                self.pool.name()
            ),
        );
        Ok(woken)
    }

    pub(crate) fn log(&self, level: LogLevel, msg: &str) {
        self.log.log(level, msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::IfaceCfg;
    use crate::api::MacAddr;
    use crate::engine::driver::CaptureDriver;
    use crate::engine::resolve::StaticResolver;

    fn iface_cfg() -> IfaceCfg {
        IfaceCfg {
            name: "net0".into(),
            ip: "10.0.0.2".parse().unwrap(),
            cidr: "10.0.0.0/24".parse().unwrap(),
            mtu: 1500,
            mac: MacAddr::from_const([2, 8, 32, 0, 0, 2]),
            tx_csum_offload: false,
            rx_csum_offload: false,
            needs_resolution: true,
        }
    }

    fn stack(cfg: StackCfg) -> Result<IpStack, StackError> {
        IpStack::new(
            cfg,
            Arc::new(CaptureDriver::new()),
            Arc::new(StaticResolver::new()),
            Providers::println(),
        )
    }

    #[test]
    fn construct() {
        let s = stack(StackCfg::single(iface_cfg())).unwrap();
        assert_eq!(s.name(), "ip0");
        assert_eq!(s.ifaces().len(), 1);
        assert_eq!(s.pool().total(), 64);
        assert_eq!(s.iface(IfIndex(0)).unwrap().name, "net0");
        assert!(s.iface(IfIndex(1)).is_none());
        assert_eq!(s.stats(), IpStatsSnap::default());
    }

    #[test]
    fn construct_errors() {
        let mut cfg = StackCfg::single(iface_cfg());
        cfg.ifaces.clear();
        assert_eq!(stack(cfg).err(), Some(StackError::NoInterfaces));

        let mut cfg = StackCfg::single(iface_cfg());
        cfg.default_pool.count = 0;
        let err = stack(cfg).err().unwrap();
        assert_eq!(err.code(), 0x09);

        let mut cfg = StackCfg::single(iface_cfg());
        cfg.name = "x".repeat(40);
        assert!(matches!(stack(cfg), Err(StackError::Stats(_))));
    }

    #[test]
    fn multicast_membership() {
        let s = stack(StackCfg::single(iface_cfg())).unwrap();
        let group: Ipv4Addr = "239.1.2.3".parse().unwrap();

        assert!(s.is_member(ALL_HOSTS));
        assert!(!s.is_member(group));
        s.multicast_join(group).unwrap();
        assert!(s.is_member(group));
        s.multicast_leave(group).unwrap();
        assert_eq!(s.multicast_leave(group), Err(StackError::NotJoined(group)));

        let unicast = "10.0.0.9".parse().unwrap();
        let err = s.multicast_join(unicast).unwrap_err();
        assert_eq!(err.code(), 0x21);
    }

    #[test]
    fn shutdown_deletes_pool() {
        let s = stack(StackCfg::single(iface_cfg())).unwrap();
        let held = s.alloc_packet(WaitOption::NoWait).unwrap();
        assert_eq!(s.shutdown(), Ok(0));
        assert_eq!(s.shutdown(), Err(PoolError::PoolDeleted));
        assert_eq!(
            s.alloc_packet(WaitOption::NoWait).err(),
            Some(PoolError::PoolDeleted)
        );
        held.release().unwrap();
    }

    #[test]
    fn idents_advance() {
        let s = stack(StackCfg::single(iface_cfg())).unwrap();
        let a = s.next_ident();
        assert_eq!(s.next_ident(), a.wrapping_add(1));
    }
}
