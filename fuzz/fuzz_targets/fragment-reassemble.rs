// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fragment a datagram at an arbitrary MTU, deliver the fragments in
//! an arbitrary order, and expect the original payload back.

#![no_main]

use libfuzzer_sys::fuzz_target;
use slabnet_test_utils::*;

fuzz_target!(|data: &[u8]| {
    let [m0, m1, rest @ ..] = data else {
        return;
    };
    let (order, payload) = rest.split_at(rest.len().min(16));
    // A header-only datagram is not deliverable.
    let payload = &payload[..payload.len().min(4096)];
    if payload.is_empty() {
        return;
    }
    let mtu = 68 + u16::from_be_bytes([*m0, *m1]) % 1500;

    let tx = host(stack_cfg(iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", mtu), 256, 512));
    let rx = host(stack_cfg(iface_cfg("net0", HOST_B_IP, "10.0.0.0/24", 1500), 256, 512));

    if send_udp(&tx.stack, ip(HOST_B_IP), payload).is_err() {
        return;
    }
    let mut frames = tx.drv.take_frames();
    assert_eq!(tx.stack.pool().available(), tx.stack.pool().total());

    // Shuffle with the order bytes.
    for (i, b) in order.iter().enumerate() {
        let n = frames.len();
        if n > 1 {
            frames.swap(i % n, usize::from(*b) % n);
        }
    }

    for f in &frames {
        let pkt = datagram_bytes(rx.stack.pool(), &f.bytes);
        let _ = rx.stack.packet_receive(pkt, IfIndex(0));
    }

    let got = rx.udp.take();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].bytes, payload);
    assert_eq!(rx.stack.pool().available(), rx.stack.pool().total());
});

fn datagram_bytes(pool: &PacketPool, bytes: &[u8]) -> Packet {
    let mut pkt = pool.allocate(0, WaitOption::NoWait).unwrap();
    pkt.append(bytes, pool, WaitOption::NoWait).unwrap();
    pkt
}
