// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Plain types shared between the slabnet engine, its tooling, and
//! its consumers: addresses, protocol numbers, and configuration.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod cfg;
pub mod ip;
pub mod mac;

pub use cfg::*;
pub use ip::*;
pub use mac::*;

/// The overall version of the API. Anytime a change is made to the
/// configuration types this value must be incremented.
pub const API_VERSION: u64 = 3;
