//! One input service: PSI acquisition, PID remapping and PCR windowing.
//!
//! A service owns the read half of its input ring. After [`Service::init`]
//! has learnt the program from the PAT, PMT and SDT, packets are pulled in
//! windows bounded by two consecutive PCRs and every packet of a window is
//! given a position on the output bit clock.

use std::collections::VecDeque;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::constants::*;
use crate::continuity::{CcStatus, ContinuityTracker, PidMap};
use crate::packet::{self, TsPacket};
use crate::psi::{
    assign_pids, build_ait, build_pmt, parse_pat, parse_pmt, parse_sdt, rewrite_eit_pf,
    AitApplication, AitReference, EitIds, PushOutcome, SdtRow, SdtService, Section,
    SectionAssembler,
};
use crate::network::Source;
use crate::report::ServiceStatus;
use crate::ringbuffer::Consumer;
use crate::scheduler::PacketSource;

/// Extends raw 42-bit PCR samples onto a monotonic timeline.
#[derive(Default)]
struct PcrClock {
    last_raw: Option<u64>,
    offset:   u64,
    regressions: u64,
}

impl PcrClock {
    fn extend(&mut self, service: usize, raw: u64) -> u64 {
        if let Some(last) = self.last_raw {
            if raw < last {
                let back = last - raw;
                if back > PCR_WRAP / 2 {
                    info!(service, "PCR wrapped");
                    self.offset += PCR_WRAP;
                } else {
                    self.regressions += 1;
                    warn!(service, last, pcr = raw, "PCR went backwards");
                }
            }
        }
        self.last_raw = Some(raw);
        raw + self.offset
    }
}

/// Packets between two PCRs. The front packet carries the previous PCR and
/// the back one the latest; the back one stays queued as the boundary of the
/// next window.
#[derive(Default)]
struct Window {
    packets:   VecDeque<TsPacket>,
    positions: VecDeque<i64>,
    /// session start, first and last PCR of the current window
    start:  u64,
    first:  u64,
    second: u64,
}

impl Window {
    fn reset(&mut self, boundary: TsPacket, pcr: u64) {
        self.packets.clear();
        self.positions.clear();
        self.packets.push_back(boundary);
        self.start = pcr;
        self.first = pcr;
        self.second = pcr;
    }

    /// Interpolate a PCR for every queued packet and convert it to output bits.
    fn plan(&mut self, bitrate: u32) {
        let n = self.packets.len() as i128;
        let first = self.first as i128;
        let span = self.second as i128 - first;
        let start = self.start as i128;
        self.positions.clear();
        for j in 0..n {
            let pcr = if n > 1 { first + span * j / (n - 1) } else { first };
            let bits = (pcr - start) * bitrate as i128 / PCR_CLOCK_HZ;
            self.positions.push_back(bits as i64);
        }
    }
}

pub struct Service {
    pub index:          usize,
    pub source:         String,
    pub new_service_id: u16,
    pub new_pmt_pid:    u16,
    pub lcn:            u16,
    hbbtv:              Option<AitApplication>,
    /// network input, as opposed to a file replay
    live:               bool,

    // learnt from the input
    pub service_id:          u16,
    pub pmt_pid:             u16,
    pub pcr_pid:             u16,
    pub new_pcr_pid:         u16,
    pub name:                String,
    pub provider:            String,
    pub service_type:        u8,
    pub original_network_id: u16,
    pmt_version: u8,
    recode:      bool,
    eit_ids:     EitIds,
    sdt_entry:   Option<SdtService>,
    new_pmt:     Option<Section>,
    ait:         Option<(u16, Section)>,

    pid_map: PidMap,
    cc:      ContinuityTracker,
    pat:     SectionAssembler,
    pmt:     SectionAssembler,
    sdt:     SectionAssembler,
    eit:     SectionAssembler,

    input:  Consumer,
    window: Window,
    clock:  PcrClock,
    sync_losses:  u64,
    window_drops: u64,
}

impl Service {
    pub fn new(index: usize, cfg: &ServiceConfig, input: Consumer) -> Self {
        let new_pmt_pid = (index as u16 + 1) * SERVICE_PID_STRIDE;
        Self {
            index,
            source: cfg.source.clone(),
            new_service_id: cfg.service_id,
            new_pmt_pid,
            lcn: cfg.lcn,
            live: matches!(Source::parse(&cfg.source), Ok(Source::Udp(_) | Source::Http(_))),
            hbbtv: cfg.hbbtv.as_ref().map(|h| AitApplication {
                application_type: h.application_type,
                version:          h.version,
                url:              h.url.clone(),
                initial_path:     h.initial_path.clone(),
            }),
            service_id: 0,
            pmt_pid: 0,
            pcr_pid: 0,
            new_pcr_pid: 0,
            name: String::new(),
            provider: String::new(),
            service_type: 0,
            original_network_id: 0,
            pmt_version: 0,
            recode: false,
            eit_ids: EitIds { service_id: cfg.service_id, transport_stream_id: 0, original_network_id: 0 },
            sdt_entry: None,
            new_pmt: None,
            ait: None,
            pid_map: PidMap::new(),
            cc: ContinuityTracker::new(),
            pat: SectionAssembler::new(TID_PAT),
            pmt: SectionAssembler::new(TID_PMT),
            sdt: SectionAssembler::new(TID_SDT_ACTUAL),
            eit: SectionAssembler::new(TID_EIT_PF_ACTUAL),
            input,
            window: Window::default(),
            clock: PcrClock::default(),
            sync_losses: 0,
            window_drops: 0,
        }
    }

    /// Next aligned packet, or `None` once the input has ended.
    fn read_packet(&mut self) -> Option<TsPacket> {
        let first = self.input.peek(0)?;
        if first != TS_SYNC_BYTE {
            self.sync_losses += 1;
            warn!(service = self.index, byte = first, "lost sync");
            let skipped = self.resync()?;
            info!(service = self.index, skipped, "sync regained");
        }

        let mut pkt = [0u8; TS_PACKET_SIZE];
        if self.input.read(&mut pkt) == 0 {
            return None;
        }
        if packet::pid(&pkt) != PID_NULL {
            if let CcStatus::Discontinuity { expected, found } = self.cc.check(&pkt) {
                warn!(service = self.index, pid = packet::pid(&pkt), expected, found, "continuity error");
            }
        }
        Some(pkt)
    }

    /// Drop bytes until a sync byte is followed by another one a packet
    /// later. At the very end of the input a lone sync byte is accepted.
    fn resync(&mut self) -> Option<usize> {
        let mut skipped = 0;
        loop {
            if self.input.peek(0)? == TS_SYNC_BYTE {
                match self.input.peek(TS_PACKET_SIZE) {
                    Some(TS_SYNC_BYTE) | None => return Some(skipped),
                    Some(_) => {}
                }
            }
            skipped += self.input.skip(1);
        }
    }

    fn next_packet(&mut self, waiting_for: &str) -> anyhow::Result<TsPacket> {
        self.read_packet()
            .with_context(|| format!("service {}: input ended while waiting for the {waiting_for}", self.index))
    }

    /// Learn the program from PAT, PMT and SDT, then allocate output PIDs and
    /// build the PMT (and AIT) this service is announced with.
    pub fn init(&mut self, transport_stream_id: u16, original_network_id: u16, recode_onids: &[u16])
        -> anyhow::Result<()>
    {
        let program = loop {
            let pkt = self.next_packet("PAT")?;
            if packet::pid(&pkt) != PID_PAT || self.pat.push(&pkt) != PushOutcome::Committed {
                continue;
            }
            let Some(section) = self.pat.take() else { continue };
            let pat = parse_pat(&section.data).with_context(|| format!("service {}", self.index))?;
            if pat.programs.len() > 1 {
                warn!(service = self.index, programs = pat.programs.len(), "PAT lists several programs, using the first");
            }
            match pat.programs.first() {
                Some(p) => break *p,
                None => warn!(service = self.index, "PAT lists no program"),
            }
        };
        self.service_id = program.program_number;
        self.pmt_pid = program.pmt_pid;
        debug!(service = self.index, service_id = self.service_id, pmt_pid = self.pmt_pid, "PAT received");

        let mut pmt = None;
        let mut sdt = None;
        while pmt.is_none() || sdt.is_none() {
            let pkt = self.next_packet("PMT and SDT")?;
            let pid = packet::pid(&pkt);

            if pid == self.pmt_pid && pmt.is_none() {
                if self.pmt.push(&pkt) == PushOutcome::Committed {
                    if let Some(s) = self.pmt.take() {
                        pmt = Some(parse_pmt(&s.data).with_context(|| format!("service {}", self.index))?);
                    }
                }
            } else if pid == PID_SDT && sdt.is_none() && self.sdt.push(&pkt) == PushOutcome::Committed {
                let Some(s) = self.sdt.take() else { continue };
                match parse_sdt(&s.data) {
                    Ok(table) => match table.find(self.service_id) {
                        Some((entry, desc)) => sdt = Some((table.original_network_id, entry.clone(), desc)),
                        None => debug!(service = self.index, service_id = self.service_id, "service not in SDT yet"),
                    },
                    Err(e) => warn!(service = self.index, error = %e, "unusable SDT"),
                }
            }
        }
        let (Some(pmt), Some((onid, entry, desc))) = (pmt, sdt) else {
            anyhow::bail!("service {}: PSI acquisition ended early", self.index);
        };

        self.pcr_pid = pmt.pcr_pid;
        self.pmt_version = pmt.version;
        let alloc = assign_pids(&pmt, self.new_pmt_pid, self.hbbtv.is_some(), &mut self.pid_map)
            .with_context(|| format!("service {}", self.index))?;
        self.new_pcr_pid = alloc.pcr_pid;

        let ait = match (&self.hbbtv, alloc.ait_pid) {
            (Some(app), Some(pid)) => Some((pid, app)),
            _ => None,
        };
        let reference = ait.map(|(pid, app)| AitReference {
            pid,
            application_type: app.application_type,
            version: app.version,
        });
        self.new_pmt = Some(build_pmt(&pmt, self.new_service_id, &self.pid_map, reference)?);
        self.ait = match ait {
            Some((pid, app)) => Some((pid, build_ait(app)?)),
            None => None,
        };

        self.name = desc.name;
        self.provider = desc.provider;
        self.service_type = desc.service_type;
        self.original_network_id = onid;
        self.recode = recode_onids.contains(&onid);
        self.sdt_entry = Some(entry);
        self.eit_ids = EitIds {
            service_id: self.new_service_id,
            transport_stream_id,
            original_network_id,
        };
        self.dump();
        Ok(())
    }

    fn dump(&self) {
        info!(
            service = self.index,
            source = %self.source,
            name = %self.name,
            provider = %self.provider,
            service_type = self.service_type,
            service_id = self.service_id,
            new_service_id = self.new_service_id,
            pmt_pid = self.pmt_pid,
            new_pmt_pid = self.new_pmt_pid,
            pcr_pid = self.pcr_pid,
            new_pcr_pid = self.new_pcr_pid,
            ait_pid = self.ait.as_ref().map(|(pid, _)| *pid),
            onid = self.original_network_id,
            recode_text = self.recode,
            "service ready"
        );
        for (from, to) in self.pid_map.mapped() {
            debug!(service = self.index, from, to, "PID mapping");
        }
    }

    /// Throw away what queued up while other services were initialised and
    /// forget every continuity counter seen so far. A file replay has no
    /// stale data, only the counters are reset.
    pub fn discard_backlog(&mut self) {
        self.cc.reset();
        if !self.live {
            return;
        }
        let stale = self.input.bytes_used() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        let skipped = self.input.skip(stale);
        info!(service = self.index, bytes = skipped, "skipped stale input");
    }

    pub fn has_started(&self) -> bool { self.input.has_started() }

    pub fn is_closed(&self) -> bool { self.input.is_closed() }

    /// Advance to the first PCR of the service. That sample anchors every
    /// bit position computed later.
    pub fn sync_to_pcr(&mut self) -> anyhow::Result<()> {
        loop {
            let mut pkt = self.next_packet("first PCR")?;
            if packet::pid(&pkt) != self.pcr_pid {
                continue;
            }
            let Some(raw) = packet::pcr(&pkt) else { continue };
            let pcr = self.clock.extend(self.index, raw);
            packet::set_pid(&mut pkt, self.new_pcr_pid);
            self.window.reset(pkt, pcr);
            debug!(service = self.index, pcr, "session start");
            return Ok(());
        }
    }

    fn queue(&mut self, pkt: TsPacket) {
        if self.window.packets.len() >= WINDOW_CAPACITY_PACKETS {
            if self.window_drops == 0 {
                warn!(service = self.index, "more than {WINDOW_CAPACITY_PACKETS} packets between two PCRs, dropping");
            }
            self.window_drops += 1;
            return;
        }
        self.window.packets.push_back(pkt);
    }

    /// Read until the next PCR, queueing every packet that survives remapping.
    /// Returns false once the input has ended.
    fn read_to_next_pcr(&mut self) -> bool {
        loop {
            let Some(mut pkt) = self.read_packet() else { return false };
            let pid = packet::pid(&pkt);

            if pid == PID_EIT {
                self.handle_eit(&pkt);
                continue;
            }
            if pid == self.pmt_pid {
                self.handle_pmt(&pkt);
                continue;
            }

            let new_pid = self.pid_map.get(pid);
            if new_pid == 0 {
                continue;
            }
            packet::set_pid(&mut pkt, new_pid);

            if pid == self.pcr_pid {
                if let Some(raw) = packet::pcr(&pkt) {
                    self.window.first = self.window.second;
                    self.window.second = self.clock.extend(self.index, raw);
                    // the boundary packet is never dropped
                    self.window.packets.push_back(pkt);
                    return true;
                }
            }
            self.queue(pkt);
        }
    }

    fn handle_eit(&mut self, pkt: &TsPacket) {
        if self.eit.push(pkt) != PushOutcome::Committed {
            return;
        }
        let Some(section) = self.eit.take() else { return };
        match rewrite_eit_pf(&section.data, self.service_id, self.eit_ids, self.recode) {
            Ok(Some(mut out)) => {
                // the scheduler stamps the continuity counter on the way out
                for p in out.packets(PID_EIT) {
                    self.queue(p);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(service = self.index, error = %e, "cannot rewrite EIT"),
        }
    }

    fn handle_pmt(&mut self, pkt: &TsPacket) {
        if self.pmt.push(pkt) != PushOutcome::Committed {
            return;
        }
        let Some(section) = self.pmt.take() else { return };
        match parse_pmt(&section.data) {
            Ok(pmt) if pmt.version != self.pmt_version => {
                warn!(service = self.index, old = self.pmt_version, new = pmt.version,
                      "PMT version changed, keeping the original PID mapping");
                self.pmt_version = pmt.version;
            }
            Ok(_) => {}
            Err(e) => warn!(service = self.index, error = %e, "unusable PMT"),
        }
    }

    pub fn new_pmt(&self) -> Option<&Section> { self.new_pmt.as_ref() }

    /// PID and section of the AIT, for services carrying a broadcast application.
    pub fn ait(&self) -> Option<(u16, &Section)> {
        self.ait.as_ref().map(|(pid, s)| (*pid, s))
    }

    pub fn sdt_row(&self) -> Option<SdtRow<'_>> {
        self.sdt_entry.as_ref().map(|source| SdtRow {
            new_service_id: self.new_service_id,
            source,
            recode: self.recode,
        })
    }

    /// Output PID an input PID is forwarded on, 0 if dropped.
    pub fn mapped_pid(&self, pid: u16) -> u16 { self.pid_map.get(pid) }
}

impl PacketSource for Service {
    fn next_position(&mut self, bitrate: u32) -> anyhow::Result<Option<i64>> {
        if self.window.packets.is_empty() {
            anyhow::bail!("service {} was not synchronised to its PCR", self.index);
        }
        if self.window.packets.len() == 1 {
            if !self.read_to_next_pcr() {
                return Ok(None);
            }
            self.window.plan(bitrate);
        }
        Ok(self.window.positions.front().copied())
    }

    fn pop(&mut self) -> Option<TsPacket> {
        self.window.positions.pop_front();
        self.window.packets.pop_front()
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            index:               self.index,
            service_id:          self.new_service_id,
            name:                self.name.clone(),
            input_bytes_used:    self.input.bytes_used(),
            input_capacity:      self.input.capacity(),
            input_dropped_bytes: self.input.dropped(),
            cc_errors:           self.cc.errors,
            crc_errors:          self.pat.crc_errors + self.pmt.crc_errors + self.sdt.crc_errors + self.eit.crc_errors,
            sync_losses:         self.sync_losses,
            window_drops:        self.window_drops,
            pcr_regressions:     self.clock.regressions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn window_positions_interpolate_between_pcrs() {
        let mut w = Window::default();
        w.reset(packet::NULL_PACKET, 27_000_000);
        w.second = 27_000_000 + 2_700_000; // 100 ms later
        w.packets.extend([packet::NULL_PACKET; 4]);
        w.plan(1_000_000);
        assert_eq!(w.positions, vec![0, 25_000, 50_000, 75_000, 100_000]);

        // the next window starts where this one ended
        w.packets.drain(..4);
        w.first = w.second;
        w.second += 2_700_000;
        w.packets.push_back(packet::NULL_PACKET);
        w.plan(1_000_000);
        assert_eq!(w.positions, vec![100_000, 200_000]);
    }

    fn service_reading(data: &[u8]) -> Service {
        let cfg = ServiceConfig { source: "in.ts".into(), service_id: 1, lcn: 1, hbbtv: None };
        let (mut tx, rx) = crate::ringbuffer::ring_buffer(1 << 16);
        assert_eq!(tx.write(data), data.len());
        Service::new(0, &cfg, rx)
    }

    fn payload_packet(pid: u16, cc: u8, tag: u8) -> TsPacket {
        let mut p = packet::NULL_PACKET;
        p[4..].fill(0);
        packet::set_pid(&mut p, pid);
        packet::set_continuity_counter(&mut p, cc);
        p[4] = tag;
        p
    }

    #[test]
    fn sync_is_confirmed_one_packet_later() {
        // a stray sync byte in the garbage is not followed by another one
        let mut data = vec![0x13, TS_SYNC_BYTE, 0x00, 0x00, TS_SYNC_BYTE];
        data.extend_from_slice(&payload_packet(0x100, 0, 1));
        data.extend_from_slice(&payload_packet(0x100, 1, 2));
        let mut s = service_reading(&data);

        let p = s.read_packet().unwrap();
        assert_eq!((packet::pid(&p), p[4]), (0x100, 1));
        assert_eq!(s.sync_losses, 1);
        let p = s.read_packet().unwrap();
        assert_eq!(p[4], 2);
        assert!(s.read_packet().is_none());
        assert_eq!(s.cc.errors, 0);
    }

    #[test]
    fn aligned_input_never_loses_sync() {
        let mut data = Vec::new();
        for cc in 0..4 {
            data.extend_from_slice(&payload_packet(0x100, cc, cc));
        }
        let mut s = service_reading(&data);
        for cc in 0..4 {
            assert_eq!(s.read_packet().unwrap()[4], cc);
        }
        assert_eq!(s.sync_losses, 0);
    }

    #[test]
    fn pcr_clock_unwraps() {
        let mut c = PcrClock::default();
        assert_eq!(c.extend(0, PCR_WRAP - 100), PCR_WRAP - 100);
        assert_eq!(c.extend(0, 50), PCR_WRAP + 50);
        assert_eq!(c.regressions, 0);

        // a small step back is reported and used as is
        assert_eq!(c.extend(0, 40), PCR_WRAP + 40);
        assert_eq!(c.regressions, 1);
    }
}
