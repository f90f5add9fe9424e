// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The boundary between the IP layer and link drivers.
//!
//! The stack hands every outgoing packet to a [`LinkDriver`] as a
//! [`DriverRequest`]. The driver takes ownership of the packet and is
//! expected to finish with it by calling
//! [`Packet::transmit_release()`], which frees it unless a transport
//! still holds it for retransmission.

use super::iface::IfIndex;
use super::packet::Packet;
use super::packet::TxDone;
use crate::api::MacAddr;
use crate::sys::sync::KMutex;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverCommand {
    PacketSend,
    PacketBroadcast,
}

/// Where on the link a packet is going.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkDest {
    Unicast(MacAddr),
    Broadcast,
    Multicast(MacAddr),
    /// The link has no addressing: point-to-point or loopback.
    None,
}

#[derive(Debug)]
pub struct DriverRequest {
    pub command: DriverCommand,
    pub iface: IfIndex,
    pub pkt: Packet,
    pub dest: LinkDest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("interface {0} is not enabled")]
    NotEnabled(IfIndex),

    #[error("transmit queue is full")]
    TxQueueDepth,
}

impl DriverError {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotEnabled(_) => 0x14,
            Self::TxQueueDepth => 0x49,
        }
    }
}

/// A link driver. An `Err` means the packet was not sent; the driver
/// has released it either way.
pub trait LinkDriver: Send + Sync {
    fn request(&self, req: DriverRequest) -> Result<(), DriverError>;
}

/// One frame as it left the stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub iface: IfIndex,
    pub command: DriverCommand,
    pub dest: LinkDest,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct CaptureState {
    frames: Vec<Frame>,
    deferred: Vec<Packet>,
    enabled: bool,
}

/// A driver that transmits into memory.
///
/// Every request is recorded as a [`Frame`] and its packet finished
/// with `transmit_release()`. Packets deferred to a retransmission
/// queue are kept so their holder can pick them up again.
pub struct CaptureDriver {
    state: KMutex<CaptureState>,
}

impl Default for CaptureDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDriver {
    pub fn new() -> Self {
        Self {
            state: KMutex::new(CaptureState { enabled: true, ..Default::default() }),
        }
    }

    /// A disabled driver refuses every request with
    /// [`DriverError::NotEnabled`].
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.clone()
    }

    pub fn take_frames(&self) -> Vec<Frame> {
        core::mem::take(&mut self.state.lock().frames)
    }

    pub fn take_deferred(&self) -> Vec<Packet> {
        core::mem::take(&mut self.state.lock().deferred)
    }
}

impl LinkDriver for CaptureDriver {
    fn request(&self, req: DriverRequest) -> Result<(), DriverError> {
        let DriverRequest { command, iface, pkt, dest } = req;
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(DriverError::NotEnabled(iface));
        }

        state.frames.push(Frame { iface, command, dest, bytes: pkt.copy_all() });

        match pkt.transmit_release() {
            Ok(TxDone::Released) => {}
            Ok(TxDone::Deferred(pkt)) => state.deferred.push(pkt),
            // The packet is parked on some other queue; whoever put it
            // there still owns it.
            Err(e) => state.deferred.push(e.pkt),
        }

        Ok(())
    }
}
