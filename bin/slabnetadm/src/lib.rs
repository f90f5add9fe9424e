// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! slabnet administration library
//!
//! A stack stood up from a configuration file with an in-memory link
//! driver, so that send and receive can be exercised and inspected
//! from the command line.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use slabnet::api::Ipv4Addr;
use slabnet::api::Protocol;
use slabnet::api::StackCfg;
use slabnet::engine::driver::CaptureDriver;
use slabnet::engine::driver::Frame;
use slabnet::engine::iface::IfIndex;
use slabnet::engine::ip::IpStack;
use slabnet::engine::ip::ProtocolHandler;
use slabnet::engine::ip::SendError;
use slabnet::engine::ip::StackError;
use slabnet::engine::ip4::Ipv4Hdr;
use slabnet::engine::packet::Packet;
use slabnet::engine::packet::PacketError;
use slabnet::engine::pool::WaitOption;
use slabnet::engine::receive::Delivery;
use slabnet::engine::receive::RecvError;
use slabnet::engine::resolve::StaticResolver;
use slabnet::engine::send::SendParams;
use slabnet::provider::Providers;
use slabnet::provider::SlogLog;
use slabnet::sys::sync::KMutex;
use slog::Drain;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tabwriter::TabWriter;

const ETHERNET_HDR_LEN: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: {err}")]
    Io { path: String, err: std::io::Error },

    #[error("bad configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("send failed (0x{code:02X}): {0}", code = .0.code())]
    Send(#[from] SendError),

    #[error("packet: {0}")]
    Packet(#[from] PacketError),

    #[error("capture: {0}")]
    Capture(String),
}

impl Error {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io { path: path.display().to_string(), err }
    }
}

/// Build the root logger. `RUST_LOG` picks the level.
pub fn logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "slabnetadm"))
}

pub fn load_cfg(path: &Path) -> Result<StackCfg, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(toml::from_str(&text)?)
}

/// Counts what the stack delivers and logs each datagram.
pub struct Sink {
    log: slog::Logger,
    delivered: KMutex<Vec<(Ipv4Hdr, IfIndex, usize)>>,
}

impl Sink {
    pub fn delivered(&self) -> Vec<(Ipv4Hdr, IfIndex, usize)> {
        self.delivered.lock().clone()
    }
}

impl ProtocolHandler for Sink {
    fn receive(&self, hdr: &Ipv4Hdr, iface: IfIndex, pkt: Packet) {
        slog::debug!(self.log, "delivered";
            "src" => %hdr.src,
            "dst" => %hdr.dst,
            "proto" => %hdr.proto,
            "iface" => %iface,
            "len" => pkt.len());
        self.delivered.lock().push((*hdr, iface, pkt.len()));
    }
}

/// A stack on an in-memory link.
pub struct Sim {
    pub stack: IpStack,
    pub drv: Arc<CaptureDriver>,
    pub resolver: Arc<StaticResolver>,
    pub sink: Arc<Sink>,
}

impl Sim {
    pub fn new(cfg: StackCfg, log: &slog::Logger) -> Result<Self, Error> {
        let drv = Arc::new(CaptureDriver::new());
        let resolver = Arc::new(StaticResolver::new());
        let providers = Providers {
            log: Box::new(SlogLog::new(log.new(slog::o!("stack" => cfg.name.clone())))),
        };
        let stack = IpStack::new(cfg, drv.clone(), resolver.clone(), providers)?;

        let sink = Arc::new(Sink {
            log: log.clone(),
            delivered: KMutex::new(vec![]),
        });
        for proto in [Protocol::Icmp, Protocol::Igmp, Protocol::Tcp, Protocol::Udp] {
            stack.register_protocol(proto, sink.clone());
        }

        Ok(Self { stack, drv, resolver, sink })
    }

    /// Send `len` bytes of filler to `dst`.
    pub fn send(&self, len: usize, params: SendParams) -> Result<(), Error> {
        let filler: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut pkt = self
            .stack
            .alloc_packet(WaitOption::NoWait)
            .map_err(PacketError::from)?;
        pkt.append(&filler, self.stack.pool(), WaitOption::NoWait)?;
        Ok(self.stack.packet_send(pkt, params)?)
    }

    /// Push every datagram of a capture through the receive path of
    /// `iface`.
    pub fn replay(
        &self,
        iface: IfIndex,
        capture: &[u8],
    ) -> Result<Vec<Result<Delivery, RecvError>>, Error> {
        let mut results = vec![];
        for dgram in read_capture(capture)? {
            let pool = self.stack.pool();
            let mut pkt = pool
                .allocate(0, WaitOption::NoWait)
                .map_err(PacketError::from)?;
            pkt.append(&dgram, pool, WaitOption::NoWait)?;
            results.push(self.stack.packet_receive(pkt, iface));
        }
        Ok(results)
    }
}

/// The IPv4 datagrams in a classic pcap capture. Ethernet captures
/// are accepted and their link headers skipped.
pub fn read_capture(bytes: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let (mut rest, hdr) = pcap::parse_pcap_header(bytes)
        .map_err(|e| Error::Capture(format!("bad header: {e:?}")))?;

    let skip = match hdr.network {
        Linktype::RAW | Linktype::IPV4 => 0,
        Linktype::ETHERNET => ETHERNET_HDR_LEN,
        other => {
            return Err(Error::Capture(format!("unsupported link type {other:?}")));
        }
    };

    let mut out = vec![];
    while !rest.is_empty() {
        let (next, block) = pcap::parse_pcap_frame(rest)
            .map_err(|e| Error::Capture(format!("bad frame: {e:?}")))?;
        if block.data.len() > skip {
            out.push(block.data[skip..].to_vec());
        }
        rest = next;
    }
    Ok(out)
}

/// Write frames as a raw IPv4 capture.
pub fn write_capture(path: &Path, frames: &[Frame]) -> Result<(), Error> {
    let mut file = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
    let mut hdr = PcapHeader {
        magic_number: 0xa1b2c3d4,
        version_major: 2,
        version_minor: 4,
        thiszone: 0,
        sigfigs: 0,
        snaplen: u32::from(u16::MAX),
        network: Linktype::RAW,
    };
    let mut out = hdr.to_vec().map_err(|e| Error::Capture(format!("{e:?}")))?;

    for f in frames {
        let mut block = LegacyPcapBlock {
            ts_sec: 0,
            ts_usec: 0,
            caplen: f.bytes.len() as u32,
            origlen: f.bytes.len() as u32,
            data: &f.bytes,
        };
        out.extend(block.to_vec().map_err(|e| Error::Capture(format!("{e:?}")))?);
    }

    file.write_all(&out).map_err(|e| Error::io(path, e))
}

/// Print one row per frame with its decoded IPv4 header.
pub fn print_frames_into(
    writer: &mut impl Write,
    frames: &[Frame],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "IFACE\tDEST\tLEN\tSRC\tDST\tIDENT\tOFFSET\tMF\tTTL")?;
    for f in frames {
        let dest = format!("{:?}", f.dest);
        match Ipv4Hdr::parse(&f.bytes) {
            Ok(h) => writeln!(
                t,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                f.iface,
                dest,
                f.bytes.len(),
                h.src,
                h.dst,
                h.ident,
                h.frag_off,
                h.more_frags(),
                h.ttl,
            )?,
            Err(e) => {
                writeln!(t, "{}\t{}\t{}\t<{e}>", f.iface, dest, f.bytes.len())?
            }
        }
    }
    t.flush()
}

/// The address a capture should be replayed to, for display.
pub fn first_dst(capture: &[Vec<u8>]) -> Option<Ipv4Addr> {
    capture.first().and_then(|d| Ipv4Hdr::parse(d).ok()).map(|h| h.dst)
}
