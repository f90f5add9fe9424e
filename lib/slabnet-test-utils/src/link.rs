// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A point-to-point link between two stacks in the same process.

use slabnet::engine::driver::DriverError;
use slabnet::engine::driver::DriverRequest;
use slabnet::engine::driver::Frame;
use slabnet::engine::driver::LinkDriver;
use slabnet::engine::iface::IfIndex;
use slabnet::engine::ip::IpStack;
use slabnet::engine::pool::WaitOption;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// The transmit side of every interface of one stack.
///
/// Each frame is copied into a packet from the peer's pool and handed
/// to the peer's receive path before `request()` returns. The sent
/// packet is always released; retransmission holds are not modeled.
#[derive(Default)]
pub struct RamLink {
    peers: Mutex<BTreeMap<IfIndex, (Weak<IpStack>, IfIndex)>>,
    frames: Mutex<Vec<Frame>>,
}

impl RamLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the far end of `iface`. Until then frames sent on it
    /// are recorded and lost.
    pub fn connect(&self, iface: IfIndex, peer: &Arc<IpStack>, peer_iface: IfIndex) {
        self.peers
            .lock()
            .unwrap()
            .insert(iface, (Arc::downgrade(peer), peer_iface));
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl LinkDriver for RamLink {
    fn request(&self, req: DriverRequest) -> Result<(), DriverError> {
        let DriverRequest { command, iface, pkt, dest } = req;
        let bytes = pkt.copy_all();
        let _ = pkt.transmit_release();

        self.frames.lock().unwrap().push(Frame {
            iface,
            command,
            dest,
            bytes: bytes.clone(),
        });

        let Some((peer, peer_iface)) = self.peers.lock().unwrap().get(&iface).cloned()
        else {
            return Ok(());
        };
        let Some(peer) = peer.upgrade() else {
            return Ok(());
        };

        let pool = peer.pool();
        let mut copy = pool
            .allocate(0, WaitOption::NoWait)
            .map_err(|_| DriverError::TxQueueDepth)?;
        copy.append(&bytes, pool, WaitOption::NoWait)
            .map_err(|_| DriverError::TxQueueDepth)?;

        // What the far end does with it is its own business.
        let _ = peer.packet_receive(copy, peer_iface);
        Ok(())
    }
}

/// Join `a` on `a_iface` to `b` on `b_iface` with a pair of links.
pub fn connect(
    a: &Arc<IpStack>,
    a_link: &RamLink,
    a_iface: IfIndex,
    b: &Arc<IpStack>,
    b_link: &RamLink,
    b_iface: IfIndex,
) {
    a_link.connect(a_iface, b, b_iface);
    b_link.connect(b_iface, a, a_iface);
}
