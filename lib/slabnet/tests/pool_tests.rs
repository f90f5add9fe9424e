// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pool and packet behavior as seen from outside the crate.

use common::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use slabnet::engine::packet::PacketError;
use slabnet_test_utils as common;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

// A region sized for exactly four slabs yields exactly four packets.
#[test]
fn exact_region_holds_four() {
    let region = vec![0u8; PacketPool::region_size(256, 4)];
    let pool = PacketPool::create("four", 256, region).unwrap();
    assert_eq!(pool.total(), 4);

    let mut held: Vec<_> = (0..4)
        .map(|_| pool.allocate(0, WaitOption::NoWait).unwrap())
        .collect();
    assert_eq!(
        pool.allocate(0, WaitOption::NoWait).unwrap_err(),
        PoolError::NoPacket
    );

    held.pop().unwrap().release().unwrap();
    let again = pool.allocate(0, WaitOption::NoWait).unwrap();
    assert_eq!(pool.available(), 0);
    drop(again);
    drop(held);
    assert_eq!(pool.available(), 4);
}

// 1000 bytes behind a 6 byte reserve in 256 byte slabs take four
// slabs and come back out unchanged.
#[test]
fn append_grows_chain() {
    let pool = PacketPool::with_capacity("chain", 256, 8).unwrap();
    let data = pattern(1000);

    let mut pkt = pool.allocate(6, WaitOption::NoWait).unwrap();
    pkt.append(&data, &pool, WaitOption::NoWait).unwrap();
    assert_eq!(pkt.seg_count(), 4);
    assert_eq!(pkt.len(), 1000);

    let mut out = vec![0u8; 1000];
    assert_eq!(pkt.retrieve(&mut out), Ok(1000));
    assert_eq!(out, data);

    let mut small = vec![0u8; 10];
    assert!(matches!(
        pkt.retrieve(&mut small),
        Err(PacketError::Overflow { needed: 1000, available: 10 })
    ));
}

#[test]
fn append_exhaustion_leaves_packet_alone() {
    let pool = PacketPool::with_capacity("small", 64, 3).unwrap();
    let mut pkt = pool.allocate(0, WaitOption::NoWait).unwrap();
    pkt.append(b"keep", &pool, WaitOption::NoWait).unwrap();

    let err = pkt.append(&pattern(400), &pool, WaitOption::NoWait).unwrap_err();
    assert_eq!(err.code(), 0x01);
    assert_eq!(pkt.copy_all(), b"keep");
    assert_eq!(pool.available(), 2);
}

#[test]
fn timed_wait_expires() {
    let pool = PacketPool::with_capacity("timed", 64, 1).unwrap();
    let _held = pool.allocate(0, WaitOption::NoWait).unwrap();
    let err = pool
        .allocate(0, WaitOption::Timeout(Duration::from_millis(20)))
        .unwrap_err();
    assert_eq!(err, PoolError::NoPacket);
    assert_eq!(pool.waiting(), 0);
}

// Many threads fighting over a few slabs never lose one.
#[test]
fn contended_churn() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let pool = PacketPool::with_capacity("churn", 128, 3).unwrap();
    let start = std::sync::Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = pool.clone();
            let start = start.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                start.wait();
                for _ in 0..ROUNDS {
                    let mut pkt = pool.allocate(0, WaitOption::Forever).unwrap();
                    let len = rng.random_range(1..=128);
                    pkt.append(&pattern(len), &pool, WaitOption::NoWait).unwrap();
                    assert_eq!(pkt.len(), len);
                    if rng.random_bool(0.5) {
                        thread::yield_now();
                    }
                    pkt.release().unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(pool.available(), 3);
    // A slab handed straight to a waiter is not a fresh allocation.
    assert_eq!(stats.allocations + stats.handoffs, (THREADS * ROUNDS) as u64);
    assert_eq!(stats.releases, (THREADS * ROUNDS) as u64);
    assert_eq!(stats.invalid_releases, 0);
}
