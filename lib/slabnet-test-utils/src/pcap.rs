// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for building and reading packet capture files.
//!
//! Frames leave the stack as bare IPv4 datagrams, so captures use the
//! raw IP link type.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use slabnet::engine::driver::Frame;
use std::fs::File;
use std::io::Write;

fn get_header(offset: &[u8]) -> (&[u8], PcapHeader) {
    match pcap::parse_pcap_header(offset) {
        Ok((new_offset, header)) => (new_offset, header),
        Err(e) => panic!("failed to get header: {e:?}"),
    }
}

fn next_block(offset: &[u8]) -> (&[u8], LegacyPcapBlock<'_>) {
    match pcap::parse_pcap_frame(offset) {
        Ok((new_offset, block)) => {
            // We always want access to the entire packet.
            assert_eq!(block.origlen, block.caplen);
            (new_offset, block)
        }

        Err(e) => panic!("failed to get next block: {e:?}"),
    }
}

/// Every packet in a capture, in order.
pub fn read_all(bytes: &[u8]) -> Vec<Vec<u8>> {
    let (mut rest, hdr) = get_header(bytes);
    assert_eq!(hdr.network, Linktype::RAW);

    let mut pkts = vec![];
    while !rest.is_empty() {
        let (next, block) = next_block(rest);
        pkts.push(block.data.to_vec());
        rest = next;
    }
    pkts
}

/// Build a packet capture from a series of frames.
pub struct PcapBuilder<W: Write> {
    out: W,
    count: u32,
}

impl PcapBuilder<File> {
    /// Create a new pcap builder, writing all captures to `path`.
    pub fn new(path: &str) -> Self {
        Self::with_writer(File::create(path).unwrap())
    }
}

impl<W: Write> PcapBuilder<W> {
    pub fn with_writer(mut out: W) -> Self {
        let mut hdr = PcapHeader {
            magic_number: 0xa1b2c3d4,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: u32::from(u16::MAX),
            network: Linktype::RAW,
        };

        out.write_all(&hdr.to_vec().unwrap()).unwrap();
        Self { out, count: 0 }
    }

    /// Add a datagram to the capture.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        // Spread the packets a millisecond apart so the capture reads
        // in order in any viewer.
        let mut block = LegacyPcapBlock {
            ts_sec: 7777 + self.count / 1000,
            ts_usec: (self.count % 1000) * 1000,
            caplen: bytes.len() as u32,
            origlen: bytes.len() as u32,
            data: bytes,
        };

        self.out.write_all(&block.to_vec().unwrap()).unwrap();
        self.count += 1;
    }

    pub fn add_frame(&mut self, frame: &Frame) {
        self.add_bytes(&frame.bytes);
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
