// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use slabnet::api::Ipv4Addr;
use slabnet::api::MacAddr;
use slabnet::api::Protocol;
use slabnet::engine::iface::IfIndex;
use slabnet::engine::pool::PacketPool;
use slabnet::engine::pool::WaitOption;
use slabnet::engine::send::SendParams;
use slabnet::print::print_ifaces_into;
use slabnet::print::print_ip_stats;
use slabnet::print::print_pool;
use slabnetadm::Sim;
use slabnetadm::first_dst;
use slabnetadm::load_cfg;
use slabnetadm::logger;
use slabnetadm::print_frames_into;
use slabnetadm::read_capture;
use slabnetadm::write_capture;

/// Drive an in-memory slabnet IPv4 stack
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Validate a stack configuration and list its interfaces.
    ShowConfig {
        #[arg(short)]
        config: PathBuf,
    },

    /// Send one datagram and show the frames handed to the driver.
    Send {
        #[arg(short)]
        config: PathBuf,

        #[arg(long)]
        dst: Ipv4Addr,

        /// Bytes of payload.
        #[arg(long, default_value_t = 64)]
        len: usize,

        /// IP protocol number.
        #[arg(long, default_value_t = Protocol::UDP)]
        proto: u8,

        #[arg(long)]
        ttl: Option<u8>,

        #[arg(long)]
        dont_frag: bool,

        /// Answer the resolution request for the next hop with this
        /// address after sending.
        #[arg(long)]
        resolve: Option<MacAddr>,

        /// Write the frames to a pcap file.
        #[arg(long)]
        pcap: Option<PathBuf>,
    },

    /// Feed a capture of IPv4 datagrams into the receive path.
    Replay {
        #[arg(short)]
        config: PathBuf,

        /// Index of the receiving interface.
        #[arg(long, default_value_t = 0)]
        iface: u16,

        capture: PathBuf,
    },

    /// Create a packet pool, hold some of it, and show its state.
    Pool {
        #[arg(long, default_value_t = 1536)]
        payload_size: usize,

        #[arg(long, default_value_t = 64)]
        count: usize,

        /// Packets to allocate and hold before printing.
        #[arg(long, default_value_t = 0)]
        hold: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let log = logger();
    let cmd = Command::parse();
    let mut stdout = std::io::stdout();

    match cmd {
        Command::ShowConfig { config } => {
            let cfg = load_cfg(&config)?;
            let sim = Sim::new(cfg, &log)?;
            println!("Stack {}", sim.stack.name());
            print_ifaces_into(&mut stdout, sim.stack.ifaces())?;
        }

        Command::Send {
            config,
            dst,
            len,
            proto,
            ttl,
            dont_frag,
            resolve,
            pcap,
        } => {
            let sim = Sim::new(load_cfg(&config)?, &log)?;
            let mut params = SendParams::new(dst, Protocol::from(proto));
            params.ttl = ttl;
            params.dont_frag = dont_frag;
            sim.send(len, params)?;

            if let Some(mac) = resolve {
                for (_, next_hop) in sim.resolver.requests() {
                    let n = sim.stack.resolution_complete(next_hop, mac);
                    slog::info!(log, "resolved"; "next_hop" => %next_hop, "drained" => n);
                }
            }

            let frames = sim.drv.take_frames();
            print_frames_into(&mut stdout, &frames)?;
            if let Some(path) = pcap {
                write_capture(&path, &frames)?;
            }
            println!();
            print_ip_stats(&sim.stack.stats())?;
        }

        Command::Replay { config, iface, capture } => {
            let sim = Sim::new(load_cfg(&config)?, &log)?;
            let bytes = std::fs::read(&capture)
                .with_context(|| format!("reading {}", capture.display()))?;

            if let Some(dst) = first_dst(&read_capture(&bytes)?) {
                slog::info!(log, "replaying"; "first_dst" => %dst);
            }

            for (i, res) in sim.replay(IfIndex(iface), &bytes)?.iter().enumerate() {
                match res {
                    Ok(d) => println!("{i}: {d:?}"),
                    Err(e) => println!("{i}: dropped (0x{:02X}): {e}", e.code()),
                }
            }
            println!();
            print_ip_stats(&sim.stack.stats())?;
        }

        Command::Pool { payload_size, count, hold } => {
            let pool = PacketPool::with_capacity("adm", payload_size, count)?;
            let held = (0..hold)
                .map(|_| pool.allocate(0, WaitOption::NoWait))
                .collect::<Result<Vec<_>, _>>()?;
            print_pool(&pool)?;
            drop(held);
        }
    }

    Ok(())
}
