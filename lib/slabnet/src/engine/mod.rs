// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The slabnet engine: packet memory and the IPv4 datapath.
pub mod checksum;
pub mod driver;
pub mod fragment;
pub mod iface;
pub mod ip;
pub mod ip4;
pub mod packet;
pub mod pool;
pub mod reassembly;
pub mod receive;
pub mod resolve;
pub mod send;

pub use ip::IpStack;
pub use packet::Packet;
pub use pool::PacketPool;
pub use pool::WaitOption;
