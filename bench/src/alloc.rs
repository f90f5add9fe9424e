// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Heap allocations as a criterion measurement.
//!
//! Packet data lives in pool slabs, so the interesting number for a
//! datapath case is how often it still reaches for the global heap,
//! for chain bookkeeping or fragment state.

use super::MeasurementInfo;
use criterion::Criterion;
use criterion::Throughput;
use criterion::measurement::Measurement;
use criterion::measurement::ValueFormatter;
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[global_allocator]
static HEAP: CountingAlloc = CountingAlloc {
    calls: AtomicU64::new(0),
    bytes: AtomicU64::new(0),
};

// Criterion runs one case at a time, so a process-wide count is
// enough.
struct CountingAlloc {
    calls: AtomicU64,
    bytes: AtomicU64,
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(layout.size() as u64, Ordering::Relaxed);
        // SAFETY: forwarded unchanged to the system allocator.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: `ptr` came from `alloc` above, i.e. from `System`.
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// What to count.
#[derive(Clone, Copy, Debug)]
pub enum Heap {
    /// Calls to the allocator.
    Allocs,
    /// Bytes requested from the allocator.
    Bytes,
}

impl Heap {
    fn read(self) -> u64 {
        match self {
            Self::Allocs => HEAP.calls.load(Ordering::Relaxed),
            Self::Bytes => HEAP.bytes.load(Ordering::Relaxed),
        }
    }
}

/// A [`Measurement`] of one [`Heap`] counter.
pub struct HeapMeasure(Heap);

impl Measurement for HeapMeasure {
    type Intermediate = u64;
    type Value = u64;

    fn start(&self) -> u64 {
        self.0.read()
    }

    fn end(&self, start: u64) -> u64 {
        self.0.read() - start
    }

    fn add(&self, v1: &u64, v2: &u64) -> u64 {
        v1 + v2
    }

    fn zero(&self) -> u64 {
        0
    }

    fn to_f64(&self, value: &u64) -> f64 {
        *value as f64
    }

    fn formatter(&self) -> &dyn ValueFormatter {
        match self.0 {
            Heap::Allocs => &COUNT,
            Heap::Bytes => &BYTES,
        }
    }
}

impl MeasurementInfo for HeapMeasure {
    fn label() -> &'static str {
        "heap"
    }
}

// Per-packet counts are small; no scaling.
struct Unscaled(&'static str);

static COUNT: Unscaled = Unscaled("");
static BYTES: Unscaled = Unscaled("B");

impl ValueFormatter for Unscaled {
    fn scale_values(&self, _typical: f64, _values: &mut [f64]) -> &'static str {
        self.0
    }

    fn scale_throughputs(
        &self,
        _typical: f64,
        _throughput: &Throughput,
        _values: &mut [f64],
    ) -> &'static str {
        self.0
    }

    fn scale_for_machines(&self, _values: &mut [f64]) -> &'static str {
        self.0
    }
}

/// A [`Criterion`] tuned for counting: the numbers are deterministic,
/// so a handful of short samples will do.
pub fn heap_crit(what: Heap) -> Criterion<HeapMeasure> {
    Criterion::default()
        .with_measurement(HeapMeasure(what))
        .sample_size(10)
        .warm_up_time(Duration::from_nanos(1))
        .measurement_time(Duration::from_micros(10))
        .nresamples(1)
        // Identical samples upset the plotting backend.
        .without_plots()
}
