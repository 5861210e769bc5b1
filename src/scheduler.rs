//! PCR-driven interleaver.
//!
//! The scheduler never looks at the wall clock. It keeps one counter, the
//! number of bits written so far, and every service packet carries the bit
//! position its PCR window assigned to it. Each step emits whichever is due
//! first: the most urgent service packet or a table whose repetition is due.
//! Stuffing fills the gap up to that position.

use tracing::{info, warn};

use crate::constants::*;
use crate::mux::MuxTables;
use crate::packet::{self, TsPacket, NULL_PACKET};
use crate::report::{OutputStatus, Reporter, ServiceStatus};
use crate::ringbuffer::Producer;
use crate::stats::StatsManager;

/// What the scheduler needs from an input service.
pub trait PacketSource {
    /// Output bit position of the next packet, `None` once the input has ended.
    fn next_position(&mut self, bitrate: u32) -> anyhow::Result<Option<i64>>;

    /// Remove the packet whose position was last returned.
    fn pop(&mut self) -> Option<TsPacket>;

    fn status(&self) -> ServiceStatus;
}

/// Repeated multiplex tables, in tie-break order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Pat,
    Pmt,
    Sdt,
    Nit,
    Ait,
}

const TABLES: [(Table, u64); 5] = [
    (Table::Pat, PAT_INTERVAL_MS),
    (Table::Pmt, PMT_INTERVAL_MS),
    (Table::Sdt, SDT_INTERVAL_MS),
    (Table::Nit, NIT_INTERVAL_MS),
    (Table::Ait, AIT_INTERVAL_MS),
];

/// Interval in milliseconds expressed as bits of output.
pub fn ms_to_bits(bitrate: u32, ms: u64) -> i64 {
    (bitrate as i64 * ms as i64) / 1000
}

/// Next due bit position of every table. A disabled table is never due.
struct TableClocks {
    due:    [i64; 5],
    period: [i64; 5],
}

impl TableClocks {
    fn new(bitrate: u32, with_ait: bool) -> Self {
        let mut due = [0; 5];
        if !with_ait {
            due[Table::Ait as usize] = i64::MAX;
        }
        Self { due, period: TABLES.map(|(_, ms)| ms_to_bits(bitrate, ms)) }
    }

    /// Earliest due table; ties go to the one listed first.
    fn earliest(&self) -> (Table, i64) {
        let mut best = (Table::Pat, self.due[0]);
        for (i, (t, _)) in TABLES.iter().enumerate().skip(1) {
            if self.due[i] < best.1 {
                best = (*t, self.due[i]);
            }
        }
        best
    }

    /// Move on by one period from when it was due, not from now.
    fn advance(&mut self, t: Table) {
        let i = t as usize;
        self.due[i] = self.due[i].saturating_add(self.period[i]);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Table(Table),
    Service(usize),
}

/// A table goes first when it is due no later than the most urgent service
/// packet. Returns the winner and the position it must not be sent before.
pub fn choose(table: (Table, i64), service: (usize, i64)) -> (Next, i64) {
    if table.1 <= service.1 {
        (Next::Table(table.0), table.1)
    } else {
        (Next::Service(service.0), service.1)
    }
}

pub struct Scheduler<S: PacketSource> {
    bitrate:  u32,
    sources:  Vec<S>,
    tables:   MuxTables,
    clocks:   TableClocks,
    output:   Producer,
    /// bits written so far
    position: i64,
    eit_cc:   u8,
    /// the output ring was full on the last write
    output_full: bool,
    stats:    StatsManager,
    report_every: u64,
}

impl<S: PacketSource> Scheduler<S> {
    pub fn new(bitrate: u32, sources: Vec<S>, tables: MuxTables, output: Producer, report_every: u64) -> Self {
        let clocks = TableClocks::new(bitrate, !tables.aits.is_empty());
        Self {
            bitrate,
            sources,
            tables,
            clocks,
            output,
            position: 0,
            eit_cc: 0,
            output_full: false,
            stats: StatsManager::new(),
            report_every: report_every.max(1),
        }
    }

    pub fn position(&self) -> i64 { self.position }

    pub fn stats(&self) -> &StatsManager { &self.stats }

    /// Write one packet; false once nobody drains the output. A full output
    /// ring loses the packet but the bit clock still moves on.
    fn emit(&mut self, pkt: &TsPacket) -> bool {
        if self.output.is_orphaned() {
            return false;
        }
        let full = !self.output.try_write_all(pkt);
        if full {
            if !self.output_full {
                warn!(dropped = self.stats.dropped_packets, "output ring full, dropping packets");
            }
            self.stats.dropped_packets += 1;
        }
        self.output_full = full;
        self.position += TS_PACKET_BITS;
        self.stats.record(packet::pid(pkt));
        if self.stats.output_packets % self.report_every == 0 {
            self.report();
        }
        true
    }

    fn pad_to(&mut self, target: i64) -> bool {
        while self.position < target {
            if !self.emit(&NULL_PACKET) {
                return false;
            }
        }
        true
    }

    fn emit_table(&mut self, t: Table) -> bool {
        let packets: Vec<TsPacket> = match t {
            Table::Pat => self.tables.pat.packets(PID_PAT),
            Table::Sdt => self.tables.sdt.packets(PID_SDT),
            Table::Nit => self.tables.nit.packets(PID_NIT),
            Table::Pmt => self.tables.pmts.iter_mut().flat_map(|(pid, s)| s.packets(*pid)).collect(),
            Table::Ait => self.tables.aits.iter_mut().flat_map(|(pid, s)| s.packets(*pid)).collect(),
        };
        self.clocks.advance(t);
        packets.iter().all(|p| self.emit(p))
    }

    /// Emit one item plus the stuffing ahead of it. `Ok(false)` once an input
    /// has ended or the output is gone.
    pub fn step(&mut self) -> anyhow::Result<bool> {
        let mut urgent: Option<(usize, i64)> = None;
        for (i, s) in self.sources.iter_mut().enumerate() {
            let Some(pos) = s.next_position(self.bitrate)? else {
                info!(service = i, "input ended, stopping the multiplex");
                return Ok(false);
            };
            if urgent.is_none_or(|(_, best)| pos < best) {
                urgent = Some((i, pos));
            }
        }
        let Some(urgent) = urgent else {
            anyhow::bail!("no services to multiplex");
        };

        let (next, target) = choose(self.clocks.earliest(), urgent);
        let sent = self.pad_to(target) && match next {
            Next::Table(t) => self.emit_table(t),
            Next::Service(i) => {
                let Some(mut pkt) = self.sources[i].pop() else {
                    anyhow::bail!("service {i} announced a packet it does not have");
                };
                // rewritten EIT sections are packetized fresh, so one counter
                // runs across all services
                if packet::pid(&pkt) == PID_EIT {
                    packet::set_continuity_counter(&mut pkt, self.eit_cc);
                    self.eit_cc = (self.eit_cc + 1) % 16;
                }
                self.emit(&pkt)
            }
        };
        if !sent {
            warn!("output closed, stopping the multiplex");
        }
        Ok(sent)
    }

    /// Run until an input ends. Dropping the scheduler closes the output ring.
    pub fn run(mut self) -> anyhow::Result<StatsManager> {
        while self.step()? {}
        self.report();
        Ok(self.stats)
    }

    fn report(&self) {
        let services: Vec<ServiceStatus> = self.sources.iter().map(PacketSource::status).collect();
        let output = OutputStatus { bytes_used: self.output.bytes_used(), capacity: self.output.capacity() };
        let json = Reporter::status_json(&self.stats, self.bitrate, output, &services);
        info!(target: "dvbmux::report", capacity_used = format_args!("{:.3}%", self.stats.capacity_used()), "{json}");
    }
}
