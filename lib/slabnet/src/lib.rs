// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! slabnet: fixed-slab packet buffers and the IPv4 send, fragment,
//! receive and forward pipeline built on top of them.
//!
//! The crate is split along the same lines as the data flow:
//!
//! * [`engine::pool`]: the slab allocator and its wait/hand-off
//!   machinery.
//! * [`engine::packet`]: packets (slab chains) and the data
//!   operations on them.
//! * [`engine::fragment`], [`engine::send`], [`engine::receive`]:
//!   the IPv4 datapath, driven through an [`engine::ip::IpStack`].

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

extern crate alloc;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as slabnet;

pub use slabnet_api as api;

pub mod engine;
#[cfg(feature = "std")]
pub mod print;
pub mod provider;
pub mod sys;
