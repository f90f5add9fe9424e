// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Arbitrary bytes on the receive path of a forwarding stack. Whatever
//! happens to the datagram, every slab must find its way home.

#![no_main]

use libfuzzer_sys::fuzz_target;
use slabnet_test_utils::*;

fuzz_target!(|data: &[u8]| {
    let mut cfg = stack_cfg(iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500), 128, 64);
    cfg.ifaces.push(iface_cfg("net1", ROUTER_NET1_IP, "192.168.0.0/24", 200));
    cfg.forwarding = true;
    let h = host(cfg);

    let pool = h.stack.pool();
    let Ok(mut pkt) = pool.allocate(0, WaitOption::NoWait) else {
        return;
    };
    if pkt.append(data, pool, WaitOption::NoWait).is_err() {
        return;
    }

    let _ = h.stack.packet_receive(pkt, IfIndex(0));
    drop(h.udp.take());
    h.drv.take_frames();
    h.stack.reassembly_expire(std::time::Instant::now() + std::time::Duration::from_secs(600));
    assert_eq!(pool.available(), pool.total());
});
