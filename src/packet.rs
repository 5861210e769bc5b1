//! Transport packet header access, PCR extraction and section packetization

use bitstream_io::{BigEndian, BitRead, BitReader};

use crate::constants::*;

pub type TsPacket = [u8; TS_PACKET_SIZE];

/// Null packet used to pad the output up to the target bitrate
pub const NULL_PACKET: TsPacket = {
    let mut p = [STUFFING_BYTE; TS_PACKET_SIZE];
    p[0] = TS_SYNC_BYTE;
    p[1] = 0x1F;
    p[2] = 0xFF;
    p[3] = 0x10;
    p
};

#[inline]
pub fn pid(p: &[u8]) -> u16 {
    (((p[1] & 0x1F) as u16) << 8) | (p[2] as u16)
}

#[inline]
pub fn set_pid(p: &mut [u8], pid: u16) {
    p[1] = (p[1] & !0x1F) | ((pid >> 8) as u8 & 0x1F);
    p[2] = pid as u8;
}

#[inline]
pub fn payload_unit_start(p: &[u8]) -> bool { p[1] & 0x40 != 0 }

/// 0 reserved, 1 payload only, 2 adaptation only, 3 adaptation + payload
#[inline]
pub fn adaptation_field_control(p: &[u8]) -> u8 { (p[3] & 0x30) >> 4 }

#[inline]
pub fn has_payload(p: &[u8]) -> bool { adaptation_field_control(p) & 0x01 != 0 }

#[inline]
pub fn continuity_counter(p: &[u8]) -> u8 { p[3] & 0x0F }

#[inline]
pub fn set_continuity_counter(p: &mut [u8], cc: u8) {
    p[3] = (p[3] & 0xF0) | (cc & 0x0F);
}

/// discontinuity_indicator of the adaptation field, false when there is none
pub fn discontinuity_indicator(p: &[u8]) -> bool {
    adaptation_field_control(p) & 0x02 != 0 && p[4] > 0 && p[5] & 0x80 != 0
}

/// Offset of the first payload byte, `None` if the packet carries no payload.
pub fn payload_offset(p: &[u8]) -> Option<usize> {
    let offset = match adaptation_field_control(p) {
        1 => 4,
        3 => 5 + p[4] as usize,
        _ => return None,
    };
    (offset < TS_PACKET_SIZE).then_some(offset)
}

/// 42-bit PCR in 27 MHz ticks (`base * 300 + extension`), if the packet has one.
pub fn pcr(p: &[u8]) -> Option<u64> {
    if p[3] & 0x20 == 0 || p[4] < 6 || p[5] & 0x10 == 0 {
        return None;
    }
    let mut br = BitReader::endian(&p[6..12], BigEndian);
    let base = br.read::<33, u64>().ok()?;
    br.skip(6).ok()?; // reserved
    let ext = br.read::<9, u64>().ok()?;
    Some(base * 300 + ext)
}

/// Slice a complete section into packets on `pid`. Only the first packet
/// carries PUSI and a zero pointer field; the last one is padded with 0xFF.
/// `cc` is advanced once per emitted packet.
pub fn packetize(section: &[u8], pid: u16, cc: &mut u8) -> Vec<TsPacket> {
    let mut out = Vec::with_capacity(section.len() / (TS_PACKET_SIZE - 4) + 1);
    let mut written = 0;
    while written < section.len() {
        let mut pkt = [STUFFING_BYTE; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        set_pid(&mut pkt, pid);
        let mut i = 4;
        if written == 0 {
            pkt[1] |= 0x40;
            pkt[4] = 0; // pointer_field
            i = 5;
        }
        pkt[3] = 0x10 | (*cc & 0x0F);
        *cc = (*cc + 1) % 16;

        let n = (TS_PACKET_SIZE - i).min(section.len() - written);
        pkt[i..i + n].copy_from_slice(&section[written..written + n]);
        written += n;
        out.push(pkt);
    }
    out
}
