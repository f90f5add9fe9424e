// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use slabnet::engine::driver::DriverError;
use slabnet::engine::driver::DriverRequest;
use slabnet_bench::MeasurementInfo;
use slabnet_bench::alloc::Heap;
use slabnet_bench::alloc::heap_crit;
use slabnet_test_utils::*;
use std::hint::black_box;

/// Finishes every packet as soon as it is handed over.
struct NullLink;

impl LinkDriver for NullLink {
    fn request(&self, req: DriverRequest) -> Result<(), DriverError> {
        let _ = req.pkt.transmit_release();
        Ok(())
    }
}

/// Drops whatever is delivered.
struct NullProto;

impl ProtocolHandler for NullProto {
    fn receive(&self, _hdr: &Ipv4Hdr, _iface: IfIndex, pkt: Packet) {
        drop(black_box(pkt));
    }
}

fn null_stack(ip: &str, mtu: u16) -> IpStack {
    let stack = IpStack::new(
        stack_cfg(iface_cfg("net0", ip, "10.0.0.0/24", mtu), 1536, 128),
        Arc::new(NullLink),
        Arc::new(StaticResolver::new()),
        Providers::println(),
    )
    .unwrap();
    stack.register_protocol(Protocol::Udp, Arc::new(NullProto));
    stack
}

fn fill(stack: &IpStack, data: &[u8]) -> Packet {
    let mut pkt = stack.alloc_packet(WaitOption::NoWait).unwrap();
    pkt.append(data, stack.pool(), WaitOption::NoWait).unwrap();
    pkt
}

pub fn pool<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let big = PacketPool::with_capacity("big", 1536, 64).unwrap();
    let small = PacketPool::with_capacity("small", 256, 64).unwrap();
    let data = pattern(1500);

    let mut c = c.benchmark_group(M::label());

    c.bench_function("allocate/release", |b| {
        b.iter(|| {
            let pkt = big.allocate(black_box(36), WaitOption::NoWait).unwrap();
            pkt.release().unwrap();
        })
    });

    c.bench_function("append 1500 into 256B slabs", |b| {
        b.iter(|| {
            let mut pkt = small.allocate(0, WaitOption::NoWait).unwrap();
            pkt.append(black_box(&data), &small, WaitOption::NoWait).unwrap();
            pkt.release().unwrap();
        })
    });
}

pub fn send<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let whole = null_stack(HOST_A_IP, 1500);
    let frag = null_stack(HOST_A_IP, 576);
    let dst = ip(HOST_B_IP);
    let data = pattern(1400);

    let mut c = c.benchmark_group(M::label());

    c.bench_function("send 1400", |b| {
        b.iter(|| {
            let pkt = fill(&whole, &data);
            whole.packet_send(pkt, SendParams::new(dst, Protocol::Udp)).unwrap();
        })
    });

    c.bench_function("send 1400 as 3 fragments", |b| {
        b.iter(|| {
            let pkt = fill(&frag, &data);
            frag.packet_send(pkt, SendParams::new(dst, Protocol::Udp)).unwrap();
        })
    });
}

pub fn receive<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let rx = null_stack(HOST_B_IP, 1500);

    // Capture the wire form of a whole and a fragmented datagram.
    let whole = host(stack_cfg(iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 1500), 1536, 16));
    send_udp(&whole.stack, ip(HOST_B_IP), &pattern(1400)).unwrap();
    let single = whole.drv.take_frames().remove(0).bytes;

    let split = host(stack_cfg(iface_cfg("net0", HOST_A_IP, "10.0.0.0/24", 576), 1536, 16));
    send_udp(&split.stack, ip(HOST_B_IP), &pattern(1400)).unwrap();
    let frags: Vec<Vec<u8>> =
        split.drv.take_frames().into_iter().map(|f| f.bytes).collect();

    let wire = |bytes: &[u8]| {
        let pool = rx.pool();
        let mut pkt = pool.allocate(0, WaitOption::NoWait).unwrap();
        pkt.append(bytes, pool, WaitOption::NoWait).unwrap();
        pkt
    };

    let mut c = c.benchmark_group(M::label());

    c.bench_function("receive 1400", |b| {
        b.iter(|| rx.packet_receive(wire(&single), IfIndex(0)).unwrap())
    });

    c.bench_function("receive and reassemble 3 fragments", |b| {
        b.iter(|| {
            for f in &frags {
                rx.packet_receive(wire(f), IfIndex(0)).unwrap();
            }
        })
    });
}

criterion_group!(wall, pool, send, receive);
criterion_group!(
    name = heap_allocs;
    config = heap_crit(Heap::Allocs);
    targets = pool, send, receive
);
criterion_group!(
    name = heap_bytes;
    config = heap_crit(Heap::Bytes);
    targets = pool, send, receive
);
criterion_main!(wall, heap_allocs, heap_bytes);
