use crate::constants::{MAX_SINGLE_PACKET_PAT_LEN, TID_PAT};
use crate::psi::section::{Section, SectionBuilder, SectionReader};

/// ─────────── PAT ───────────
#[derive(Clone, Debug)]
pub struct PatSection {
    pub transport_stream_id: u16,
    pub version:      u8,
    pub programs:     Vec<PatEntry>,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid:        u16,
}

/// Parse a PAT that must fit a single section in a single packet.
pub fn parse_pat(section: &[u8]) -> anyhow::Result<PatSection> {
    let sec = SectionReader::new(section)?;
    if sec.table_id != TID_PAT { anyhow::bail!("not PAT"); }
    if sec.section_length > MAX_SINGLE_PACKET_PAT_LEN {
        anyhow::bail!("multi-packet PAT not supported (section_length {})", sec.section_length);
    }
    if sec.last_section != 0 {
        anyhow::bail!("multi-section PAT not supported (last_section_number {})", sec.last_section);
    }
    if sec.body.len() % 4 != 0 {
        anyhow::bail!("PAT section_length {} is not 9 + 4 * programs", sec.section_length);
    }

    let programs = sec.body
        .chunks_exact(4)
        .map(|e| PatEntry {
            program_number: u16::from_be_bytes([e[0], e[1]]),
            pmt_pid:        (((e[2] & 0x1F) as u16) << 8) | (e[3] as u16),
        })
        .filter(|e| e.program_number != 0) // NIT reference
        .collect();
    Ok(PatSection{ transport_stream_id: sec.table_ext, version: sec.version, programs })
}

/// One program per carried service: new service id → new PMT PID.
pub fn build_pat(transport_stream_id: u16, version: u8, programs: &[PatEntry]) -> anyhow::Result<Section> {
    let mut b = SectionBuilder::new(TID_PAT, 0x80, transport_stream_id, version);
    for p in programs {
        b.u16(p.program_number).u16(0xE000 | p.pmt_pid);
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_then_parse() {
        let entries = [
            PatEntry { program_number: 0x1001, pmt_pid: 100 },
            PatEntry { program_number: 0x1002, pmt_pid: 200 },
        ];
        let s = build_pat(0x2000, 1, &entries).unwrap();
        assert_eq!(s.data.len(), 8 + 8 + 4);
        let pat = parse_pat(&s.data).unwrap();
        assert_eq!(pat.transport_stream_id, 0x2000);
        assert_eq!(pat.programs, entries.to_vec());
    }

    #[test]
    fn network_entry_is_skipped() {
        let entries = [
            PatEntry { program_number: 0, pmt_pid: 0x10 },
            PatEntry { program_number: 7, pmt_pid: 0x20 },
        ];
        let pat = parse_pat(&build_pat(1, 0, &entries).unwrap().data).unwrap();
        assert_eq!(pat.programs, vec![entries[1]]);
    }

    #[test]
    fn multi_section_is_rejected() {
        let mut s = build_pat(1, 0, &[PatEntry { program_number: 1, pmt_pid: 0x20 }]).unwrap().data;
        s[7] = 1; // last_section_number
        let n = s.len();
        let crc = crate::psi::section::crc32(&s[..n - 4]);
        s[n - 4..].copy_from_slice(&crc.to_be_bytes());
        assert!(parse_pat(&s).is_err());
    }

    #[test]
    fn oversized_pat_is_rejected() {
        let entries: Vec<_> = (1..=50).map(|i| PatEntry { program_number: i, pmt_pid: 0x20 + i }).collect();
        let s = build_pat(1, 0, &entries).unwrap();
        assert!(parse_pat(&s.data).is_err());
    }
}
