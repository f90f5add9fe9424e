// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print stack state in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both slabnetadm and integration tests.

use crate::engine::iface::Interface;
use crate::engine::ip::IpStatsSnap;
use crate::engine::pool::PacketPool;
use crate::engine::pool::PoolStatsSnap;
use std::io::Write;
use tabwriter::TabWriter;

/// Print the occupancy and counters of a [`PacketPool`].
pub fn print_pool(pool: &PacketPool) -> std::io::Result<()> {
    print_pool_into(&mut std::io::stdout(), pool)
}

/// Print the occupancy and counters of a [`PacketPool`] into a given
/// writer.
pub fn print_pool_into(
    writer: &mut impl Write,
    pool: &PacketPool,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "NAME\tPAYLOAD\tTOTAL\tAVAIL\tWAITING")?;
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}",
        pool.name(),
        pool.payload_size(),
        pool.total(),
        pool.available(),
        pool.waiting(),
    )?;
    t.flush()?;

    writeln!(t)?;
    write_pool_stats(&mut t, &pool.stats())?;
    t.flush()
}

fn write_pool_stats(
    t: &mut impl Write,
    snap: &PoolStatsSnap,
) -> std::io::Result<()> {
    write_counters(t, &snap.fields())
}

/// Print the interface table of a stack.
pub fn print_ifaces_into<'a>(
    writer: &mut impl Write,
    ifaces: impl IntoIterator<Item = &'a Interface>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "INDEX\tNAME\tADDRESS\tSUBNET\tMTU\tMAC")?;
    for ifc in ifaces {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            ifc.index, ifc.name, ifc.ip, ifc.cidr, ifc.mtu, ifc.mac,
        )?;
    }
    t.flush()
}

/// Print an [`IpStatsSnap`].
pub fn print_ip_stats(snap: &IpStatsSnap) -> std::io::Result<()> {
    print_ip_stats_into(&mut std::io::stdout(), snap)
}

/// Print an [`IpStatsSnap`] into a given writer.
pub fn print_ip_stats_into(
    writer: &mut impl Write,
    snap: &IpStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    write_counters(&mut t, &snap.fields())?;
    t.flush()
}

fn write_counters(
    t: &mut impl Write,
    fields: &[(&'static str, u64)],
) -> std::io::Result<()> {
    writeln!(t, "COUNTER\tVALUE")?;
    write_hr(t)?;
    for (name, val) in fields {
        writeln!(t, "{name}\t{val}")?;
    }
    Ok(())
}

/// Write a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<40}", "")
}
