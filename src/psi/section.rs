// psi/section.rs
//! Section reassembly, CRC-32 (MPEG-2) validation and section building.

use bytes::{BufMut, BytesMut};
use crc::{CRC_32_MPEG_2, Crc};
use tracing::warn;

use crate::constants::{MAX_SECTION_SIZE, TS_PACKET_SIZE};
use crate::packet;

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-32/MPEG-2 over `data` (seed all-ones, no reflection, no final xor).
pub fn crc32(data: &[u8]) -> u32 { CRC_MPEG.checksum(data) }

/// A section carrying its trailing CRC checks to zero.
pub fn crc_ok(section: &[u8]) -> bool { crc32(section) == 0 }

/// One complete table section: header, body and CRC.
/// `cc` is the continuity counter used when we transmit it ourselves.
#[derive(Clone, Default, Debug)]
pub struct Section {
    pub data: Vec<u8>,
    pub cc:   u8,
}

impl Section {
    pub fn new(data: Vec<u8>) -> Self { Self { data, cc: 0 } }

    pub fn table_id(&self) -> u8 { self.data[0] }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Packetize on `pid`, advancing our own continuity counter.
    pub fn packets(&mut self, pid: u16) -> Vec<packet::TsPacket> {
        packet::packetize(&self.data, pid, &mut self.cc)
    }
}

/// Where a [`SectionAssembler`] stands after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// wrong table id or no section start while idle
    Ignored,
    Accumulating,
    /// a new section passed its CRC and is now the committed copy
    Committed,
    /// the section completed but failed its CRC; it was discarded
    CrcError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Empty,
    Accumulating,
    Committed,
}

/// Reassembles one logical table from the packets of its PID.
///
/// Keeps an in-progress buffer and a committed copy, so readers never see a
/// half-received version.
pub struct SectionAssembler {
    table_id:   u8,
    pending:    Vec<u8>,
    expected:   usize,
    committed:  Option<Section>,
    pub crc_errors: u64,
}

impl SectionAssembler {
    pub fn new(table_id: u8) -> Self {
        Self {
            table_id,
            pending: Vec::with_capacity(MAX_SECTION_SIZE),
            expected: 0,
            committed: None,
            crc_errors: 0,
        }
    }

    pub fn table_id(&self) -> u8 { self.table_id }

    pub fn state(&self) -> AssemblyState {
        if self.expected > 0 {
            AssemblyState::Accumulating
        } else if self.committed.is_some() {
            AssemblyState::Committed
        } else {
            AssemblyState::Empty
        }
    }

    pub fn committed(&self) -> Option<&Section> { self.committed.as_ref() }

    /// Hand the committed section to the caller, leaving nothing committed.
    pub fn take(&mut self) -> Option<Section> { self.committed.take() }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.expected = 0;
        self.committed = None;
    }

    /// Feed one 188-byte packet already known to be on this table's PID.
    pub fn push(&mut self, pkt: &[u8]) -> PushOutcome {
        let Some(mut offset) = packet::payload_offset(pkt) else {
            return if self.expected > 0 { PushOutcome::Accumulating } else { PushOutcome::Ignored };
        };
        let pusi = packet::payload_unit_start(pkt);

        if self.expected == 0 {
            if !pusi {
                return PushOutcome::Ignored;
            }
            offset += 1 + pkt[offset] as usize; // pointer_field
            if offset + 3 > TS_PACKET_SIZE || pkt[offset] != self.table_id {
                return PushOutcome::Ignored;
            }
            let sec_len = (((pkt[offset + 1] & 0x0F) as usize) << 8) | pkt[offset + 2] as usize;
            self.expected = (3 + sec_len).min(MAX_SECTION_SIZE);
            self.pending.clear();
        } else if pusi {
            let pointer = pkt[offset] as usize;
            offset += 1;
            if pointer < self.expected - self.pending.len() {
                warn!(table_id = self.table_id, pid = packet::pid(pkt), "payload_unit_start set within section");
                // the truncated section is lost, the one at the pointer is not
                self.expected = 0;
                self.pending.clear();
                return self.push(pkt);
            }
        }

        let take = (TS_PACKET_SIZE - offset.min(TS_PACKET_SIZE)).min(self.expected - self.pending.len());
        self.pending.extend_from_slice(&pkt[offset..offset + take]);

        if self.pending.len() < self.expected {
            return PushOutcome::Accumulating;
        }

        self.expected = 0;
        if crc_ok(&self.pending) {
            let cc = self.committed.as_ref().map_or(0, |s| s.cc);
            self.committed = Some(Section { data: std::mem::take(&mut self.pending), cc });
            self.pending.reserve(MAX_SECTION_SIZE);
            PushOutcome::Committed
        } else {
            self.crc_errors += 1;
            warn!(table_id = self.table_id, length = self.pending.len(), "CRC error, skipping section");
            self.pending.clear();
            PushOutcome::CrcError
        }
    }
}

/// Read-only view of a long-form section header.
pub struct SectionReader<'a> {
    pub table_id:      u8,
    pub section_length: usize,
    pub table_ext:     u16,   // program_number / transport_stream_id / service_id
    pub version:       u8,
    pub current_next:  bool,
    pub section_number:u8,
    pub last_section:  u8,
    pub body:          &'a [u8],   // bytes between fixed header & CRC
}

impl<'a> SectionReader<'a> {
    /// Validates length and CRC-32 of a section starting at its table_id.
    pub fn new(section: &'a [u8]) -> anyhow::Result<Self> {
        if section.len() < 12 { anyhow::bail!("short section") }
        let sec_len = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        if sec_len < 9 { anyhow::bail!("invalid section_length") }
        let end = 3 + sec_len;
        if end > section.len() { anyhow::bail!("truncated section") }
        if !crc_ok(&section[..end]) { anyhow::bail!("CRC-32 mismatch") }

        Ok(Self {
            table_id:       section[0],
            section_length: sec_len,
            table_ext:      u16::from_be_bytes([section[3], section[4]]),
            version:        (section[5] & 0x3E) >> 1,
            current_next:   section[5] & 0x01 != 0,
            section_number: section[6],
            last_section:   section[7],
            body:           &section[8..end - 4],
        })
    }
}

/// Builds a long-form section. Length fields are reserved on open and
/// back-filled on close; `finish` patches section_length and appends the CRC.
pub struct SectionBuilder {
    buf: BytesMut,
}

impl SectionBuilder {
    /// Fixed 8-byte header: table_id, length placeholder, id, version,
    /// current_next = 1, section 0 of 0. `flags` are the top bits of byte 1.
    pub fn new(table_id: u8, flags: u8, table_ext: u16, version: u8) -> Self {
        let mut buf = BytesMut::with_capacity(MAX_SECTION_SIZE);
        buf.put_u8(table_id);
        buf.put_u16((flags as u16) << 8);
        buf.put_u16(table_ext);
        buf.put_u8(0xC0 | ((version & 0x1F) << 1) | 0x01);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        Self { buf }
    }

    /// Reuse the 8-byte header of `src` (version, section numbers, flags),
    /// replacing only table_id_extension.
    pub fn from_header(src: &[u8], table_ext: u16) -> anyhow::Result<Self> {
        if src.len() < 8 { anyhow::bail!("short section header") }
        let mut buf = BytesMut::with_capacity(MAX_SECTION_SIZE);
        buf.put_u8(src[0]);
        buf.put_u16(((src[1] & 0xF0) as u16) << 8);
        buf.put_u16(table_ext);
        buf.put_slice(&src[5..8]);
        Ok(Self { buf })
    }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn u8(&mut self, v: u8) -> &mut Self { self.buf.put_u8(v); self }

    pub fn u16(&mut self, v: u16) -> &mut Self { self.buf.put_u16(v); self }

    pub fn u32(&mut self, v: u32) -> &mut Self { self.buf.put_u32(v); self }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self { self.buf.put_slice(v); self }

    /// Reserve a 16-bit length field whose top 4 bits are `reserved`.
    /// Returns the field offset for [`close_length`](Self::close_length).
    pub fn open_length(&mut self, reserved: u8) -> usize {
        let at = self.buf.len();
        self.buf.put_u16(((reserved & 0xF0) as u16) << 8);
        at
    }

    /// Back-fill the 12-bit length at `at` with the bytes written since.
    pub fn close_length(&mut self, at: usize) -> usize {
        let n = self.buf.len() - at - 2;
        self.patch_len12(at, n);
        n
    }

    /// Reserve a one-byte descriptor length.
    pub fn open_u8_length(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_u8(0);
        at
    }

    /// Back-fill the one-byte length at `at`; fails if more than 255 bytes
    /// were written since.
    pub fn close_u8_length(&mut self, at: usize) -> anyhow::Result<usize> {
        let n = self.buf.len() - at - 1;
        if n > 0xFF {
            anyhow::bail!("descriptor of {n} bytes does not fit a one-byte length");
        }
        self.buf[at] = n as u8;
        Ok(n)
    }

    fn patch_len12(&mut self, at: usize, n: usize) {
        self.buf[at] = (self.buf[at] & 0xF0) | ((n >> 8) as u8 & 0x0F);
        self.buf[at + 1] = n as u8;
    }

    /// Patch section_length, append the CRC and return the finished section.
    pub fn finish(mut self) -> anyhow::Result<Section> {
        let total = self.buf.len() + 4;
        if total > MAX_SECTION_SIZE {
            anyhow::bail!("section of {total} bytes exceeds {MAX_SECTION_SIZE}");
        }
        self.patch_len12(1, total - 3);
        let crc = crc32(&self.buf);
        self.buf.put_u32(crc);
        Ok(Section::new(self.buf.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NULL_PACKET, packetize};
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn sample_section(body: &[u8]) -> Section {
        let mut b = SectionBuilder::new(0x42, 0xF0, 0x1234, 3);
        b.bytes(body);
        b.finish().unwrap()
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc32(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn builder_backfills_length_and_crc() {
        let s = sample_section(&[1, 2, 3]);
        assert_eq!(s.data.len(), 8 + 3 + 4);
        let r = SectionReader::new(&s.data).unwrap();
        assert_eq!(r.section_length, s.data.len() - 3);
        assert_eq!(r.table_ext, 0x1234);
        assert_eq!(r.version, 3);
        assert!(r.current_next);
        assert_eq!(r.body, &[1, 2, 3]);
    }

    #[test]
    fn nested_lengths() {
        let mut b = SectionBuilder::new(0x02, 0xB0, 1, 1);
        let outer = b.open_length(0xF0);
        b.u8(0xAA);
        let inner = b.open_u8_length();
        b.bytes(&[1, 2, 3, 4]);
        assert_eq!(b.close_u8_length(inner).unwrap(), 4);
        assert_eq!(b.close_length(outer), 6);
        let s = b.finish().unwrap();
        assert_eq!(&s.data[8..16], &[0xF0, 0x06, 0xAA, 0x04, 1, 2, 3, 4]);
    }

    #[test]
    fn single_packet_commits() {
        let s = sample_section(&[9; 20]);
        let mut cc = 0;
        let pkts = packetize(&s.data, 0x11, &mut cc);
        let mut asm = SectionAssembler::new(0x42);
        assert_eq!(asm.state(), AssemblyState::Empty);
        assert_eq!(asm.push(&pkts[0]), PushOutcome::Committed);
        assert_eq!(asm.state(), AssemblyState::Committed);
        assert_eq!(asm.committed().unwrap().data, s.data);
    }

    #[test]
    fn other_table_id_is_ignored() {
        let s = sample_section(&[9; 20]);
        let mut cc = 0;
        let pkts = packetize(&s.data, 0x11, &mut cc);
        let mut asm = SectionAssembler::new(0x46);
        assert_eq!(asm.push(&pkts[0]), PushOutcome::Ignored);
        assert_eq!(asm.state(), AssemblyState::Empty);
    }

    #[test]
    fn continuation_without_start_is_ignored() {
        let mut asm = SectionAssembler::new(0x42);
        assert_eq!(asm.push(&NULL_PACKET), PushOutcome::Ignored);
    }

    #[test]
    fn multi_packet_commits_once() {
        let s = sample_section(&[7; 600]);
        let mut cc = 0;
        let pkts = packetize(&s.data, 0x11, &mut cc);
        assert_eq!(pkts.len(), 4);
        let mut asm = SectionAssembler::new(0x42);
        let outcomes: Vec<_> = pkts.iter().map(|p| asm.push(p)).collect();
        assert_eq!(outcomes, vec![
            PushOutcome::Accumulating,
            PushOutcome::Accumulating,
            PushOutcome::Accumulating,
            PushOutcome::Committed,
        ]);
        assert_eq!(asm.take().unwrap().data, s.data);
        assert_eq!(asm.state(), AssemblyState::Empty);
    }

    #[test]
    fn new_section_mid_way_replaces_the_truncated_one() {
        let long = sample_section(&[7; 600]);
        let short = sample_section(&[1; 10]);
        let mut cc = 0;
        let mut asm = SectionAssembler::new(0x42);
        assert_eq!(asm.push(&packetize(&long.data, 0x11, &mut cc)[0]), PushOutcome::Accumulating);
        assert_eq!(asm.push(&packetize(&short.data, 0x11, &mut cc)[0]), PushOutcome::Committed);
        assert_eq!(asm.take().unwrap().data, short.data);
    }

    #[test]
    fn section_ending_before_the_pointer_commits() {
        let a = sample_section(&[3; 240]);
        let b = sample_section(&[4; 10]);
        let mut cc = 0;
        let first = packetize(&a.data, 0x11, &mut cc)[0];
        let rest = &a.data[TS_PACKET_SIZE - 5..];

        let mut second = NULL_PACKET;
        crate::packet::set_pid(&mut second, 0x11);
        second[1] |= 0x40;
        second[3] = 0x11;
        second[4] = rest.len() as u8;
        second[5..5 + rest.len()].copy_from_slice(rest);
        second[5 + rest.len()..5 + rest.len() + b.data.len()].copy_from_slice(&b.data);

        let mut asm = SectionAssembler::new(0x42);
        assert_eq!(asm.push(&first), PushOutcome::Accumulating);
        assert_eq!(asm.push(&second), PushOutcome::Committed);
        assert_eq!(asm.take().unwrap().data, a.data);
    }

    #[test]
    fn corrupted_section_is_rejected() {
        let s = sample_section(&[7; 300]);
        let mut cc = 0;
        let mut pkts = packetize(&s.data, 0x11, &mut cc);
        pkts[1][50] ^= 0x04;
        let mut asm = SectionAssembler::new(0x42);
        assert_eq!(asm.push(&pkts[0]), PushOutcome::Accumulating);
        assert_eq!(asm.push(&pkts[1]), PushOutcome::CrcError);
        assert_eq!(asm.state(), AssemblyState::Empty);
        assert_eq!(asm.crc_errors, 1);
    }

    #[test]
    fn bad_version_keeps_previous_commit() {
        let good = sample_section(&[1; 10]);
        let mut cc = 0;
        let mut asm = SectionAssembler::new(0x42);
        asm.push(&packetize(&good.data, 0x11, &mut cc)[0]);
        let mut bad = packetize(&sample_section(&[2; 10]).data, 0x11, &mut cc);
        bad[0][10] ^= 0xFF;
        assert_eq!(asm.push(&bad[0]), PushOutcome::CrcError);
        assert_eq!(asm.committed().unwrap().data, good.data);
    }

    #[quickcheck]
    fn prop_segment_then_reassemble_is_identity(body: Vec<u8>) -> bool {
        let body = &body[..body.len().min(MAX_SECTION_SIZE - 12)];
        let s = sample_section(body);
        let mut cc = 0;
        let mut asm = SectionAssembler::new(0x42);
        let outcomes: Vec<_> = packetize(&s.data, 0x11, &mut cc).iter().map(|p| asm.push(p)).collect();
        outcomes.last() == Some(&PushOutcome::Committed)
            && outcomes.iter().filter(|o| **o == PushOutcome::Committed).count() == 1
            && asm.committed().map(|c| c.data == s.data).unwrap_or(false)
    }

    #[quickcheck]
    fn prop_single_bit_flip_is_rejected(body: Vec<u8>, pos: usize, bit: u8) -> bool {
        let body = &body[..body.len().min(1000)];
        let mut s = sample_section(body);
        // flip anywhere after the length field so the declared size is kept
        let at = 3 + pos % (s.data.len() - 3);
        s.data[at] ^= 1 << (bit % 8);
        let mut cc = 0;
        let mut asm = SectionAssembler::new(0x42);
        let outcomes: Vec<_> = packetize(&s.data, 0x11, &mut cc).iter().map(|p| asm.push(p)).collect();
        outcomes.last() == Some(&PushOutcome::CrcError) && asm.committed().is_none()
    }
}
