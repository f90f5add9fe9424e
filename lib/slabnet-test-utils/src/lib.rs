// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod link;
pub mod pcap;

// Let's make our lives easier and pub use a bunch of stuff.
pub use link::RamLink;
pub use slabnet::api::IfaceCfg;
pub use slabnet::api::Ipv4Addr;
pub use slabnet::api::MacAddr;
pub use slabnet::api::Protocol;
pub use slabnet::api::StackCfg;
pub use slabnet::engine::driver::CaptureDriver;
pub use slabnet::engine::driver::DriverCommand;
pub use slabnet::engine::driver::Frame;
pub use slabnet::engine::driver::LinkDest;
pub use slabnet::engine::driver::LinkDriver;
pub use slabnet::engine::iface::IfIndex;
pub use slabnet::engine::ip::IpStack;
pub use slabnet::engine::ip::ProtocolHandler;
pub use slabnet::engine::ip::SendError;
pub use slabnet::engine::ip4::Ipv4Flags;
pub use slabnet::engine::ip4::Ipv4Hdr;
pub use slabnet::engine::packet::Packet;
pub use slabnet::engine::pool::PacketPool;
pub use slabnet::engine::pool::PoolError;
pub use slabnet::engine::pool::WaitOption;
pub use slabnet::engine::receive::Delivery;
pub use slabnet::engine::receive::RecvError;
pub use slabnet::engine::resolve::StaticResolver;
pub use slabnet::engine::send::SendParams;
pub use slabnet::provider::Providers;
pub use smoltcp::wire::Ipv4Packet as WireIpv4;
pub use std::sync::Arc;
use std::sync::Mutex;

pub const HOST_A_IP: &str = "10.0.0.2";
pub const HOST_B_IP: &str = "10.0.0.3";
pub const ROUTER_NET0_IP: &str = "10.0.0.1";
pub const ROUTER_NET1_IP: &str = "192.168.0.1";
pub const FAR_HOST_IP: &str = "192.168.0.20";

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn mac(id: u8) -> MacAddr {
    MacAddr::from([0xA8, 0x40, 0x25, 0x00, 0x00, id])
}

/// An interface on a link that does not need address resolution.
pub fn iface_cfg(name: &str, ip: &str, cidr: &str, mtu: u16) -> IfaceCfg {
    IfaceCfg {
        name: name.into(),
        ip: ip.parse().unwrap(),
        cidr: cidr.parse().unwrap(),
        mtu,
        mac: MacAddr::ZERO,
        tx_csum_offload: false,
        rx_csum_offload: false,
        needs_resolution: false,
    }
}

pub fn stack_cfg(iface: IfaceCfg, payload_size: usize, count: usize) -> StackCfg {
    let mut cfg = StackCfg::single(iface);
    cfg.default_pool.payload_size = payload_size;
    cfg.default_pool.count = count;
    cfg
}

/// A repeating byte pattern, so misplaced data shows up in a diff.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// One datagram as a protocol handler saw it.
#[derive(Clone, Debug)]
pub struct Delivered {
    pub hdr: Ipv4Hdr,
    pub iface: IfIndex,
    pub bytes: Vec<u8>,
}

/// A protocol handler that keeps a copy of everything delivered to
/// it and releases the packet.
#[derive(Default)]
pub struct Recorder {
    got: Mutex<Vec<Delivered>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<Delivered> {
        std::mem::take(&mut self.got.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.got.lock().unwrap().len()
    }
}

impl ProtocolHandler for Recorder {
    fn receive(&self, hdr: &Ipv4Hdr, iface: IfIndex, pkt: Packet) {
        self.got.lock().unwrap().push(Delivered {
            hdr: *hdr,
            iface,
            bytes: pkt.copy_all(),
        });
    }
}

/// A stack whose driver records frames in memory.
pub struct Host {
    pub stack: Arc<IpStack>,
    pub drv: Arc<CaptureDriver>,
    pub resolver: Arc<StaticResolver>,
    pub udp: Arc<Recorder>,
}

pub fn host(cfg: StackCfg) -> Host {
    let drv = Arc::new(CaptureDriver::new());
    let resolver = Arc::new(StaticResolver::new());
    let stack = Arc::new(
        IpStack::new(cfg, drv.clone(), resolver.clone(), Providers::println())
            .unwrap(),
    );
    let udp = Arc::new(Recorder::default());
    stack.register_protocol(Protocol::Udp, udp.clone());
    Host { stack, drv, resolver, udp }
}

/// A stack wired to a [`RamLink`].
pub struct LinkedHost {
    pub stack: Arc<IpStack>,
    pub link: Arc<RamLink>,
    pub udp: Arc<Recorder>,
}

pub fn linked_host(cfg: StackCfg) -> LinkedHost {
    let link = Arc::new(RamLink::new());
    let stack = Arc::new(
        IpStack::new(
            cfg,
            link.clone(),
            Arc::new(StaticResolver::new()),
            Providers::println(),
        )
        .unwrap(),
    );
    let udp = Arc::new(Recorder::default());
    stack.register_protocol(Protocol::Udp, udp.clone());
    LinkedHost { stack, link, udp }
}

/// Send `data` to `dst` as a UDP payload.
pub fn send_udp(stack: &IpStack, dst: Ipv4Addr, data: &[u8]) -> Result<(), SendError> {
    let mut pkt = stack.alloc_packet(WaitOption::NoWait).unwrap();
    pkt.append(data, stack.pool(), WaitOption::NoWait).unwrap();
    stack.packet_send(pkt, SendParams::new(dst, Protocol::Udp))
}

/// Build a received datagram: an encoded header followed by payload.
pub fn datagram(pool: &PacketPool, hdr: &Ipv4Hdr, payload: &[u8]) -> Packet {
    let mut pkt = pool.allocate(0, WaitOption::NoWait).unwrap();
    pkt.append(&hdr.emit(true), pool, WaitOption::NoWait).unwrap();
    pkt.append(payload, pool, WaitOption::NoWait).unwrap();
    pkt
}

/// Check a frame as an IPv4 datagram with an independent parser and
/// return it.
pub fn wire_ipv4(bytes: &[u8]) -> WireIpv4<&[u8]> {
    let pkt = WireIpv4::new_checked(bytes).unwrap();
    assert!(pkt.verify_checksum(), "bad header checksum");
    pkt
}
