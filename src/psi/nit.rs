// psi/nit.rs
//! Network Information Table (actual network, tid 0x40).
//!
//! We build a single-transport NIT describing our own multiplex and can
//! parse one back, which is handy for checking what we send.

use bitstream_io::{BigEndian, BitWrite, BitWriter};

use crate::constants::*;
use crate::modulation::Modulation;
use crate::psi::descriptors;
use crate::psi::section::{Section, SectionBuilder, SectionReader};

#[derive(Clone)]
pub struct NitSection {
    pub version: u8,
    pub network_id: u16,
    pub transports: Vec<Transport>,
}

#[derive(Clone)]
pub struct Transport {
    pub ts_id: u16,
    pub orig_net_id: u16,
    pub descriptors: Vec<u8>,
}

impl Transport {
    pub fn descriptor(&self, tag: u8) -> Option<&[u8]> {
        descriptors(&self.descriptors).find(|(t, _)| *t == tag).map(|(_, d)| &d[2..])
    }
}

pub fn parse_nit(payload: &[u8]) -> anyhow::Result<NitSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != TID_NIT_ACTUAL && sec.table_id != 0x41 {
        anyhow::bail!("not NIT");
    }

    let b = sec.body;                 // shorthand, already stripped CRC
    if b.len() < 4 {
        anyhow::bail!("NIT body too short");
    }

    let network_id = sec.table_ext;
    let net_desc_len = (((b[0] & 0x0F) as usize) << 8) | b[1] as usize;

    let mut idx = 2 + net_desc_len;   // skip network descriptors
    if idx + 2 > b.len() { anyhow::bail!("truncated network descriptors"); }
    let loop_len = (((b[idx] & 0x0F) as usize) << 8) | b[idx + 1] as usize;
    idx += 2;
    if idx + loop_len != b.len() {
        anyhow::bail!("transport_stream_loop_length {loop_len} does not match the section");
    }

    let mut transports = Vec::new();
    while idx + 6 <= b.len() {
        let ts_id       = u16::from_be_bytes([b[idx], b[idx + 1]]);
        let orig_net_id = u16::from_be_bytes([b[idx + 2], b[idx + 3]]);
        let desc_len    = (((b[idx + 4] & 0x0F) as usize) << 8) | b[idx + 5] as usize;
        let end = idx + 6 + desc_len;
        if end > b.len() { break; }   // graceful exit on malformed len
        transports.push(Transport { ts_id, orig_net_id, descriptors: b[idx + 6..end].to_vec() });
        idx = end;
    }

    Ok(NitSection { version: sec.version, network_id, transports })
}

/// One entry of the service list and LCN descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NitService {
    pub service_id:   u16,
    pub service_type: u8,
    pub lcn:          u16,
}

/// Body of the terrestrial_delivery_system_descriptor (EN 300 468 §6.2.13.4).
pub fn terrestrial_delivery(m: &Modulation) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(11);
    {
        let mut w = BitWriter::endian(&mut out, BigEndian);
        w.write::<32, u32>(m.frequency_khz * 100)?;     // 10 Hz units
        w.write::<3, u8>(m.bandwidth_code()?)?;
        w.write_bit(true)?;                              // priority: HP
        w.write_bit(true)?;                              // no time slicing
        w.write_bit(true)?;                              // no MPE-FEC
        w.write::<2, u8>(0b11)?;
        w.write::<2, u8>(m.constellation.code())?;
        w.write::<3, u8>(0)?;                            // non-hierarchical
        w.write::<3, u8>(m.code_rate_hp.code()?)?;
        w.write::<3, u8>(0)?;                            // code_rate LP
        w.write::<2, u8>(m.guard_interval.code())?;
        w.write::<2, u8>(m.transmission_mode.code())?;
        w.write_bit(true)?;                              // other_frequency_flag
        w.write::<32, u32>(0xFFFF_FFFF)?;
    }
    Ok(out)
}

pub fn build_nit(network_id: u16, transport_stream_id: u16, original_network_id: u16,
                 services: &[NitService], modulation: &Modulation) -> anyhow::Result<Section>
{
    let mut b = SectionBuilder::new(TID_NIT_ACTUAL, 0xF0, network_id, 1);
    b.u16(0xF000); // no network descriptors
    let ts_loop = b.open_length(0xF0);

    b.u16(transport_stream_id).u16(original_network_id);
    let ts_desc = b.open_length(0xF0);

    b.u8(DESC_SERVICE_LIST);
    let at = b.open_u8_length();
    for s in services {
        b.u16(s.service_id).u8(s.service_type);
    }
    b.close_u8_length(at)?;

    let delivery = terrestrial_delivery(modulation)?;
    b.u8(DESC_TERRESTRIAL_DELIVERY).u8(delivery.len() as u8).bytes(&delivery);

    // receivers ignore the LCN descriptor without it
    b.u8(DESC_PRIVATE_DATA_SPECIFIER).u8(4).u32(original_network_id as u32);

    b.u8(DESC_LOGICAL_CHANNEL);
    let at = b.open_u8_length();
    for s in services {
        b.u16(s.service_id).u16(0xFC00 | (s.lcn & 0x03FF)); // visible
    }
    b.close_u8_length(at)?;

    b.close_length(ts_desc);
    b.close_length(ts_loop);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::{CodeRate, Constellation, GuardInterval, TransmissionMode};
    use pretty_assertions::assert_eq;

    fn modulation() -> Modulation {
        Modulation {
            frequency_khz:     802_000,
            bandwidth_khz:     8000,
            transmission_mode: TransmissionMode::Mode8k,
            constellation:     Constellation::Qam64,
            guard_interval:    GuardInterval::G1_4,
            code_rate_hp:      CodeRate::R2_3,
        }
    }

    #[test]
    fn delivery_descriptor_bits() {
        let d = terrestrial_delivery(&modulation()).unwrap();
        let freq = (802_000u32 * 100).to_be_bytes();
        assert_eq!(d, vec![freq[0], freq[1], freq[2], freq[3], 0x1F, 0x81, 0x1B, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn nit_describes_the_multiplex() {
        let services = [
            NitService { service_id: 0x1001, service_type: 0x01, lcn: 7 },
            NitService { service_id: 0x1002, service_type: 0x19, lcn: 50 },
        ];
        let s = build_nit(0x3005, 0x0002, 0x233A, &services, &modulation()).unwrap();
        let nit = parse_nit(&s.data).unwrap();
        assert_eq!(nit.network_id, 0x3005);
        assert_eq!(nit.transports.len(), 1);

        let ts = &nit.transports[0];
        assert_eq!((ts.ts_id, ts.orig_net_id), (0x0002, 0x233A));
        assert_eq!(ts.descriptor(DESC_SERVICE_LIST).unwrap(), &[0x10, 0x01, 0x01, 0x10, 0x02, 0x19]);
        assert_eq!(ts.descriptor(DESC_PRIVATE_DATA_SPECIFIER).unwrap(), &[0, 0, 0x23, 0x3A]);
        assert_eq!(ts.descriptor(DESC_LOGICAL_CHANNEL).unwrap(), &[0x10, 0x01, 0xFC, 0x07, 0x10, 0x02, 0xFC, 0x32]);
        assert_eq!(ts.descriptor(DESC_TERRESTRIAL_DELIVERY).unwrap().len(), 11);
    }

    #[test]
    fn lcn_list_longer_than_a_descriptor_fails() {
        let services: Vec<NitService> = (0..64)
            .map(|i| NitService { service_id: 0x1000 + i, service_type: 1, lcn: i })
            .collect();
        // 63 entries of 4 bytes still fit
        assert!(build_nit(1, 1, 1, &services[..63], &modulation()).is_ok());
        let err = build_nit(1, 1, 1, &services, &modulation()).unwrap_err();
        assert!(err.to_string().contains("one-byte length"));
    }

    #[test]
    fn bad_modulation_fails_build() {
        let m = Modulation { bandwidth_khz: 1700, ..modulation() };
        assert!(build_nit(1, 1, 1, &[], &m).is_err());
    }
}
