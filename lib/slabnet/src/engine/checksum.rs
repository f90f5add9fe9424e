// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum (RFC 1071).
//!
//! # Checksums and Endianness
//!
//! The checksum is a sequence of two bytes, not a logical `u16`.
//! Each pair of bytes being summed, and the result, are treated as
//! native 16-bit integers (`{to,from}_ne_bytes()`). On a
//! little-endian host this logically swaps every word, but since the
//! summed bytes are in network order, storing the result back to
//! memory swaps it back into network order. No byte-order conversion
//! is ever performed on the checksum field itself.
//!
//! A sum may be built from several byte runs, as when a header is
//! spread over more than one slab. A run of odd length leaves a
//! dangling byte which is paired with the first byte of the next run,
//! exactly as if the runs were contiguous.

/// The checksum value as it is stored in a network header: the one's
/// complement of the one's complement sum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    /// Return the bytes of this header checksum.
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap checksum bytes read from a header.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    fn from(mut csum: Checksum) -> HeaderChecksum {
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement checksum calculation.
///
/// Carries are accumulated in the upper half of the sum and folded
/// back when the value is finalized, or sooner if the sum gets close
/// to overflowing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
    odd: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new rolling checksum, starting with the passed in
    /// `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::new();
        csum.add_bytes(bytes);
        csum
    }

    /// Add the contents of `bytes` to the sum.
    pub fn add_bytes(&mut self, mut bytes: &[u8]) {
        if let Some(hi) = self.odd.take() {
            match bytes.split_first() {
                Some((lo, rest)) => {
                    self.add_word([hi, *lo]);
                    bytes = rest;
                }

                None => {
                    self.odd = Some(hi);
                    return;
                }
            }
        }

        let mut words = bytes.chunks_exact(2);
        for w in &mut words {
            self.add_word([w[0], w[1]]);
        }

        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
    }

    fn add_word(&mut self, word: [u8; 2]) {
        // See the module-level comment about why it's important to
        // convert using native-endian.
        self.inner = self.inner.wrapping_add(u16::from_ne_bytes(word) as u32);
        if self.inner & 0x8000_0000 != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }
    }

    /// Finalize the sum by adding up all the accumulated carries and
    /// returning the resulting value as a `u16`.
    pub fn finalize(&mut self) -> u16 {
        if let Some(hi) = self.odd.take() {
            self.add_word([hi, 0]);
        }

        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

/// Does a header whose checksum field is included in `bytes` verify?
pub fn verify(bytes: &[u8]) -> bool {
    Checksum::compute(bytes).finalize() == 0xFFFF
}
