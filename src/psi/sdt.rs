// psi/sdt.rs
use crate::constants::{DESC_SERVICE, TID_SDT_ACTUAL};
use crate::psi::descriptors;
use crate::psi::section::{Section, SectionBuilder, SectionReader};
use crate::psi::text::{decode_text, recode_text};

pub struct SdtSection {
    pub version:             u8,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub services:            Vec<SdtService>,
}

#[derive(Clone, Debug)]
pub struct SdtService {
    pub service_id:     u16,
    pub running_status: u8,
    pub descriptors:    Vec<u8>,
}

/// What the service descriptor says about one service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescription {
    pub service_type: u8,
    pub provider:     String,
    pub name:         String,
}

/// SDT actual (table_id 0x42).
pub fn parse_sdt(section: &[u8]) -> anyhow::Result<SdtSection> {
    let sec = SectionReader::new(section)?;
    if sec.table_id != TID_SDT_ACTUAL {
        anyhow::bail!("not SDT");
    }

    let b = sec.body;
    if b.len() < 3 {
        anyhow::bail!("SDT body too short");
    }
    let original_network_id = u16::from_be_bytes([b[0], b[1]]);

    let mut idx = 3;                              // start of service loop
    let mut services = Vec::new();
    while idx + 5 <= b.len() {
        let service_id = u16::from_be_bytes([b[idx], b[idx + 1]]);
        let running_status = (b[idx + 3] & 0xE0) >> 5;
        let desc_len   = (((b[idx + 3] & 0x0F) as usize) << 8) | b[idx + 4] as usize;
        let end = idx + 5 + desc_len;
        if end > b.len() {
            anyhow::bail!("SDT descriptor loop of service {service_id} runs past the section");
        }
        services.push(SdtService { service_id, running_status, descriptors: b[idx + 5..end].to_vec() });
        idx = end;
    }

    Ok(SdtSection {
        version: sec.version,
        transport_stream_id: sec.table_ext,
        original_network_id,
        services,
    })
}

/// (service_type, provider_name, service_name) of a service descriptor
fn service_descriptor_fields(d: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let body = d.get(2..)?;
    let service_type = *body.first()?;
    let plen = *body.get(1)? as usize;
    let provider = body.get(2..2 + plen)?;
    let nlen = *body.get(2 + plen)? as usize;
    let name = body.get(3 + plen..3 + plen + nlen)?;
    Some((service_type, provider, name))
}

impl SdtService {
    pub fn description(&self) -> Option<ServiceDescription> {
        descriptors(&self.descriptors)
            .filter(|(tag, _)| *tag == DESC_SERVICE)
            .find_map(|(_, d)| service_descriptor_fields(d))
            .map(|(service_type, provider, name)| ServiceDescription {
                service_type,
                provider: decode_text(provider),
                name:     decode_text(name),
            })
    }
}

impl SdtSection {
    /// The entry of `service_id` if it carries a service descriptor.
    /// `None` means "not in this section yet", keep waiting.
    pub fn find(&self, service_id: u16) -> Option<(&SdtService, ServiceDescription)> {
        self.services
            .iter()
            .filter(|s| s.service_id == service_id)
            .find_map(|s| s.description().map(|d| (s, d)))
    }
}

/// Re-encode the service descriptor, inserting the Latin-1 marker if asked.
fn copy_service_descriptor(b: &mut SectionBuilder, src: &[u8], recode: bool) {
    for (tag, d) in descriptors(src).filter(|(tag, _)| *tag == DESC_SERVICE) {
        debug_assert_eq!(tag, DESC_SERVICE);
        match (recode, service_descriptor_fields(d)) {
            (true, Some((service_type, provider, name))) => {
                let mut out = vec![service_type];
                recode_text(&mut out, provider, 255, None);
                recode_text(&mut out, name, 255, None);
                let len = out.len().min(255);
                b.u8(DESC_SERVICE).u8(len as u8).bytes(&out[..len]);
            }
            _ => { b.bytes(d); }
        }
    }
}

/// One output SDT row: new service id plus the source row it is derived from.
pub struct SdtRow<'a> {
    pub new_service_id: u16,
    pub source:         &'a SdtService,
    pub recode:         bool,
}

pub fn build_sdt(transport_stream_id: u16, original_network_id: u16, rows: &[SdtRow<'_>]) -> anyhow::Result<Section> {
    let mut b = SectionBuilder::new(TID_SDT_ACTUAL, 0xE0, transport_stream_id, 1);
    b.u16(original_network_id).u8(0xFF);
    for row in rows {
        b.u16(row.new_service_id);
        b.u8(0xFC | 0x01); // EIT_schedule 0, EIT_present_following 1
        // running_status, free_CA_mode 0, descriptors_loop_length
        let at = b.open_length((row.source.running_status & 0x07) << 5);
        copy_service_descriptor(&mut b, &row.source.descriptors, row.recode);
        b.close_length(at);
    }
    b.finish()
}
