use crate::constants::*;
use crate::continuity::PidMap;
use crate::psi::descriptors;
use crate::psi::section::{Section, SectionBuilder, SectionReader};

/// ─────────── PMT ───────────
#[derive(Clone, Debug)]
pub struct PmtSection {
    pub version:        u8,
    pub program_number: u16,
    pub pcr_pid:        u16,
    pub program_info:   Vec<u8>,     // program-level descriptor loop, verbatim
    pub streams:        Vec<StreamInfo>,
}
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub stream_type:   u8,
    pub elementary_pid:u16,
    pub es_info:       Vec<u8>,
}

pub fn parse_pmt(section: &[u8]) -> anyhow::Result<PmtSection> {
    let sec = SectionReader::new(section)?;
    if sec.table_id != TID_PMT { anyhow::bail!("not PMT"); }
    if sec.last_section != 0 {
        anyhow::bail!("multi-section PMT not supported (last_section_number {})", sec.last_section);
    }
    let b = sec.body;
    if b.len() < 4 { anyhow::bail!("PMT body too short"); }

    /* ── fixed header inside the body ── */
    let pcr_pid       = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    if 4 + prog_info_len > b.len() { anyhow::bail!("truncated program_info"); }
    let program_info  = b[4..4 + prog_info_len].to_vec();
    let mut idx       = 4 + prog_info_len;

    /* ── ES loop ── */
    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let pid   = (((b[idx+1] & 0x1F) as u16) << 8) | (b[idx+2] as u16);
        let eslen = (((b[idx+3] & 0x0F) as usize) << 8) | (b[idx+4] as usize);
        let end   = (idx + 5 + eslen).min(b.len());
        streams.push(StreamInfo{ stream_type:stype, elementary_pid:pid, es_info: b[idx+5..end].to_vec() });
        idx += 5 + eslen;
    }

    Ok(PmtSection{ version:sec.version,
                   program_number:sec.table_ext,
                   pcr_pid,
                   program_info,
                   streams })
}

/// Output PIDs handed out for one service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PidAllocation {
    pub pcr_pid: u16,
    pub ait_pid: Option<u16>,
    /// first PID not used by this service
    pub next_free: u16,
}

/// Map every forwarded elementary stream to consecutive PIDs above `new_pmt_pid`.
/// The PCR PID is always mapped, even when it carries no forwarded stream.
pub fn assign_pids(pmt: &PmtSection, new_pmt_pid: u16, with_ait: bool, map: &mut PidMap)
    -> anyhow::Result<PidAllocation>
{
    let mut new_pid = new_pmt_pid + 1;
    for s in &pmt.streams {
        if FORWARDED_STREAM_TYPES.contains(&s.stream_type) && !map.is_mapped(s.elementary_pid) {
            map.set(s.elementary_pid, new_pid);
            new_pid += 1;
        }
    }
    if !map.is_mapped(pmt.pcr_pid) {
        map.set(pmt.pcr_pid, new_pid);
        new_pid += 1;
    }
    let ait_pid = with_ait.then(|| {
        new_pid += 1;
        new_pid - 1
    });
    if new_pid > new_pmt_pid + SERVICE_PID_STRIDE {
        anyhow::bail!("service at PMT PID {new_pmt_pid} needs {} PIDs, only {} available",
                      new_pid - new_pmt_pid, SERVICE_PID_STRIDE);
    }
    Ok(PidAllocation { pcr_pid: map.get(pmt.pcr_pid), ait_pid, next_free: new_pid })
}

/// Drop CA descriptors and the 0xC0 private descriptor.
fn copy_es_descriptors(b: &mut SectionBuilder, src: &[u8]) {
    for (tag, d) in descriptors(src) {
        if tag != DESC_CA && tag != DESC_CANAL_PLUS_PRIVATE {
            b.bytes(d);
        }
    }
}

/// HbbTV signalling carried in the rebuilt PMT
#[derive(Clone, Copy, Debug)]
pub struct AitReference {
    pub pid:              u16,
    pub application_type: u16,
    pub version:          u8,
}

/// Rebuild the PMT of one service with remapped PIDs.
pub fn build_pmt(pmt: &PmtSection, new_service_id: u16, map: &PidMap, ait: Option<AitReference>)
    -> anyhow::Result<Section>
{
    let mut b = SectionBuilder::new(TID_PMT, 0xB0, new_service_id, 1);
    b.u16(0xE000 | map.get(pmt.pcr_pid));
    let info = b.open_length(0xF0);
    b.bytes(&pmt.program_info);
    b.close_length(info);

    for s in pmt.streams.iter().filter(|s| map.is_mapped(s.elementary_pid)) {
        b.u8(s.stream_type).u16(0xE000 | map.get(s.elementary_pid));
        let es = b.open_length(0xF0);
        copy_es_descriptors(&mut b, &s.es_info);
        b.close_length(es);
    }

    if let Some(ait) = ait {
        b.u8(STREAM_TYPE_AIT).u16(0xE000 | ait.pid);
        let es = b.open_length(0xF0);
        b.u8(DESC_APPLICATION_SIGNALLING).u8(3);
        b.u16(0x8000 | ait.application_type).u8(ait.version);
        b.close_length(es);
    }
    b.finish()
}
