// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! End-to-end tests of the IPv4 datapath.
//!
//! Frames are checked with an independent IPv4 parser rather than the
//! crate's own, and stacks are joined by in-memory links so that a
//! datagram can be followed from one stack's send path through
//! another's receive path.

use common::link::connect;
use common::pcap::PcapBuilder;
use common::pcap::read_all;
use common::*;
use slabnet::engine::ip::ALL_HOSTS;
use slabnet_test_utils as common;

fn two_hosts(mtu: u16) -> (LinkedHost, LinkedHost) {
    two_hosts_with(mtu, false)
}

// With `needs_resolution` set, unicast would wait on a resolver that
// never answers; broadcast and multicast still go out.
fn two_hosts_with(mtu: u16, needs_resolution: bool) -> (LinkedHost, LinkedHost) {
    let end = |addr| {
        let mut ifc = iface_cfg("net0", addr, "10.0.0.0/24", mtu);
        ifc.needs_resolution = needs_resolution;
        linked_host(stack_cfg(ifc, 512, 32))
    };
    let a = end(HOST_A_IP);
    let b = end(HOST_B_IP);
    connect(&a.stack, &a.link, IfIndex(0), &b.stack, &b.link, IfIndex(0));
    (a, b)
}

// A 1500 byte payload over a 576 byte MTU leaves as three fragments.
// Only the last clears more-fragments, and the source packet is
// released exactly once.
#[test]
fn fragments_over_small_mtu() {
    let h = host(stack_cfg(
        iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 576),
        512,
        32,
    ));
    let data = pattern(1500);
    send_udp(&h.stack, ip(HOST_B_IP), &data).unwrap();

    let frames = h.drv.take_frames();
    assert_eq!(frames.len(), 3);

    let mut cap = PcapBuilder::with_writer(vec![]);
    let mut payload = vec![];
    let mut ident = None;
    for (i, f) in frames.iter().enumerate() {
        let w = wire_ipv4(&f.bytes);
        assert!(f.bytes.len() <= 576);
        assert_eq!(w.more_frags(), i < 2, "fragment {i}");
        assert_eq!(usize::from(w.frag_offset()), payload.len());
        assert_eq!(*ident.get_or_insert(w.ident()), w.ident());
        payload.extend_from_slice(w.payload());
        cap.add_frame(f);
    }
    assert_eq!(payload, data);

    // The capture carries exactly what went to the driver.
    let captured = read_all(&cap.into_inner());
    assert_eq!(captured.len(), 3);
    assert_eq!(captured[2], frames[2].bytes);

    let st = h.stack.stats();
    assert_eq!(st.total_fragment_requests, 1);
    assert_eq!(st.successful_fragment_requests, 1);
    assert_eq!(st.total_fragments_sent, 3);
    assert_eq!(h.stack.pool().available(), 32);
    assert_eq!(h.stack.pool().stats().invalid_releases, 0);
}

// With room for four waiting packets, the fifth and sixth push out
// the oldest two. Only one resolution request goes out.
#[test]
fn resolution_queue_overflow() {
    let mut ifc = iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500);
    ifc.needs_resolution = true;
    let h = host(stack_cfg(ifc, 256, 16));
    let dst = ip(HOST_B_IP);

    for i in 0..6u8 {
        send_udp(&h.stack, dst, &[i; 8]).unwrap();
    }

    assert!(h.drv.frames().is_empty());
    assert_eq!(h.resolver.requests(), vec![(IfIndex(0), dst)]);
    assert_eq!(h.stack.pending(dst), 4);
    assert_eq!(h.stack.stats().resolution_queue_drops, 2);
    assert_eq!(h.stack.pool().available(), 12);

    assert_eq!(h.stack.resolution_complete(dst, mac(3)), 4);
    let frames = h.drv.take_frames();
    let firsts: Vec<u8> = frames.iter().map(|f| f.bytes[20]).collect();
    assert_eq!(firsts, [2, 3, 4, 5]);
    assert!(frames.iter().all(|f| f.dest == LinkDest::Unicast(mac(3))));
    assert_eq!(h.stack.pool().available(), 16);
}

#[test]
fn resolution_failure_releases_queue() {
    let mut ifc = iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500);
    ifc.needs_resolution = true;
    let h = host(stack_cfg(ifc, 256, 16));
    let dst = ip(HOST_B_IP);

    send_udp(&h.stack, dst, b"one").unwrap();
    send_udp(&h.stack, dst, b"two").unwrap();
    assert_eq!(h.stack.resolution_failed(dst), 2);
    assert_eq!(h.stack.pending(dst), 0);
    assert_eq!(h.stack.stats().send_packets_dropped, 2);
    assert_eq!(h.stack.pool().available(), 16);
}

// A known neighbor goes out immediately.
#[test]
fn resolved_neighbor_sends_at_once() {
    let mut ifc = iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500);
    ifc.needs_resolution = true;
    let h = host(stack_cfg(ifc, 256, 16));
    h.resolver.insert(ip(HOST_B_IP), mac(3));

    send_udp(&h.stack, ip(HOST_B_IP), b"hi").unwrap();
    let frames = h.drv.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].dest, LinkDest::Unicast(mac(3)));
    assert!(h.resolver.requests().is_empty());
}

#[test]
fn datagram_crosses_link() {
    let (a, b) = two_hosts(1500);
    send_udp(&a.stack, ip(HOST_B_IP), b"over the wire").unwrap();

    let got = b.udp.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].bytes, b"over the wire");
    assert_eq!(got[0].hdr.src, ip(HOST_A_IP));
    assert_eq!(got[0].hdr.ttl, a.stack.cfg().default_ttl);
    assert_eq!(a.link.frames().len(), 1);
    assert_eq!(b.stack.stats().total_packets_delivered, 1);
}

#[test]
fn fragments_reassemble_across_link() {
    let (a, b) = two_hosts(576);
    let data = pattern(3000);
    send_udp(&a.stack, ip(HOST_B_IP), &data).unwrap();

    assert_eq!(a.link.frames().len(), 6);
    let got = b.udp.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].bytes, data);
    assert!(!got[0].hdr.is_fragment());

    let st = b.stack.stats();
    assert_eq!(st.total_fragments_received, 6);
    assert_eq!(st.packets_reassembled, 1);
    assert_eq!(a.stack.pool().available(), 32);
    assert_eq!(b.stack.pool().available(), 32);
}

// A sends to a host behind a router. The router's far side has a
// smaller MTU, so it must fragment what it forwards, and the far host
// puts it back together.
#[test]
fn forwarded_and_refragmented() {
    let mut a_cfg = stack_cfg(
        iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500),
        512,
        32,
    );
    a_cfg.gateway = Some(ip(ROUTER_NET0_IP));
    let a = linked_host(a_cfg);

    let mut r_cfg = stack_cfg(
        iface_cfg("net0", ROUTER_NET0_IP, "10.0.0.0/24", 1500),
        512,
        64,
    );
    r_cfg
        .ifaces
        .push(iface_cfg("net1", ROUTER_NET1_IP, "192.168.0.0/24", 576));
    r_cfg.forwarding = true;
    let r = linked_host(r_cfg);

    let mut c_cfg = stack_cfg(
        iface_cfg("net0", FAR_HOST_IP, "192.168.0.0/24", 576),
        512,
        32,
    );
    c_cfg.gateway = Some(ip(ROUTER_NET1_IP));
    let c = linked_host(c_cfg);

    connect(&a.stack, &a.link, IfIndex(0), &r.stack, &r.link, IfIndex(0));
    connect(&r.stack, &r.link, IfIndex(1), &c.stack, &c.link, IfIndex(0));

    let data = pattern(1200);
    send_udp(&a.stack, ip(FAR_HOST_IP), &data).unwrap();

    assert_eq!(a.link.frames().len(), 1);
    let out = r.link.frames();
    assert_eq!(out.len(), 3);
    for f in &out {
        let w = wire_ipv4(&f.bytes);
        assert_eq!(f.iface, IfIndex(1));
        assert_eq!(w.hop_limit(), a.stack.cfg().default_ttl - 1);
    }

    let got = c.udp.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].bytes, data);
    assert_eq!(got[0].hdr.src, ip(HOST_A_IP));

    let st = r.stack.stats();
    assert_eq!(st.packets_forwarded, 1);
    assert_eq!(st.total_fragments_sent, 3);
    assert_eq!(r.stack.pool().available(), 64);
}

#[test]
fn dont_fragment_is_honored_when_forwarding() {
    let a = host({
        let mut cfg = stack_cfg(
            iface_cfg("net0", ROUTER_NET0_IP, "10.0.0.0/24", 1500),
            512,
            32,
        );
        cfg.ifaces
            .push(iface_cfg("net1", ROUTER_NET1_IP, "192.168.0.0/24", 576));
        cfg.forwarding = true;
        cfg
    });

    let mut hdr = Ipv4Hdr::new(
        ip(HOST_A_IP),
        ip(FAR_HOST_IP),
        Protocol::Udp,
        64,
        1000,
    )
    .unwrap();
    hdr.flags.insert(Ipv4Flags::DONT_FRAGMENT);
    let pkt = datagram(a.stack.pool(), &hdr, &pattern(1000));

    let res = a.stack.packet_receive(pkt, IfIndex(0));
    assert!(matches!(res, Err(RecvError::Forward(SendError::CannotFragment { .. }))));
    assert!(a.drv.frames().is_empty());
    assert_eq!(a.stack.pool().available(), 32);
}

#[test]
fn loopback_never_reaches_driver() {
    let h = host(stack_cfg(
        iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500),
        256,
        8,
    ));
    send_udp(&h.stack, ip("127.0.0.1"), b"self").unwrap();
    send_udp(&h.stack, ip(HOST_A_IP), b"me").unwrap();

    assert!(h.drv.frames().is_empty());
    let got = h.udp.take();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].bytes, b"self");
    assert_eq!(got[1].bytes, b"me");
    assert_eq!(h.stack.pool().available(), 8);
}

#[test]
fn all_hosts_reaches_peer() {
    let (a, b) = two_hosts_with(1500, true);
    send_udp(&a.stack, ALL_HOSTS, b"everyone").unwrap();

    // The sender hears its own multicast as well.
    assert_eq!(a.udp.take().len(), 1);
    let got = b.udp.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].hdr.dst, ALL_HOSTS);
    assert!(matches!(a.link.frames()[0].dest, LinkDest::Multicast(_)));
}

#[test]
fn subnet_broadcast() {
    let (a, b) = two_hosts_with(1500, true);
    send_udp(&a.stack, ip("10.0.0.255"), b"bcast").unwrap();

    let f = &a.link.frames()[0];
    assert_eq!(f.command, DriverCommand::PacketBroadcast);
    assert_eq!(f.dest, LinkDest::Broadcast);
    assert_eq!(b.udp.take()[0].bytes, b"bcast");
}
