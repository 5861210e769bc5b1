// psi/eit.rs
//! EIT present/following (actual, table_id 0x4E) rewriting.
//!
//! The service, transport stream and network ids are replaced with the
//! multiplex ones. For networks known to send unmarked Latin-1 text the
//! short and extended event descriptors are recoded as well.

use tracing::debug;

use crate::constants::{DESC_EXTENDED_EVENT, DESC_SHORT_EVENT, TID_EIT_PF_ACTUAL};
use crate::psi::descriptors;
use crate::psi::section::{Section, SectionBuilder, SectionReader};
use crate::psi::text::{recode_text, Overflow};

/// service_id .. last_table_id
const EIT_HEADER_LEN: usize = 14;
/// event_id, start_time, duration
const EVENT_FIXED_LEN: usize = 10;
/// Extended event descriptors are kept at or below this length
const EXTENDED_EVENT_MAX_LEN: usize = 253;

/// Ids written into every rewritten EIT section.
#[derive(Clone, Copy, Debug)]
pub struct EitIds {
    pub service_id:          u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
}

fn short_event(out: &mut Vec<u8>, d: &[u8]) -> Option<()> {
    let body = d.get(2..)?;
    let lang = body.get(..3)?;
    let name_len = *body.get(3)? as usize;
    let name = body.get(4..4 + name_len)?;
    let text_len = *body.get(4 + name_len)? as usize;
    let text = body.get(5 + name_len..5 + name_len + text_len)?;

    let mut inner = lang.to_vec();
    recode_text(&mut inner, name, 255 - 3 - 1 - 1, None);
    let room = 255 - inner.len() - 1;
    recode_text(&mut inner, text, room, None);
    out.push(DESC_SHORT_EVENT);
    out.push(inner.len() as u8);
    out.extend(inner);
    Some(())
}

fn extended_event_fields(d: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let body = d.get(2..)?;
    let header = body.get(..4)?; // numbers, ISO 639 language
    let items_len = *body.get(4)? as usize;
    let items = body.get(4..5 + items_len)?;
    let text_len = *body.get(5 + items_len)? as usize;
    let text = body.get(6 + items_len..6 + items_len + text_len)?;
    Some((header, items, text))
}

/// Returns the offset of the descriptor_number byte within `out`, `None` for
/// a descriptor too short to be read.
///
/// A descriptor whose item loop leaves no room for text passes all of its
/// text, and anything carried in, on to the next one.
fn extended_event(out: &mut Vec<u8>, d: &[u8], overflow: &mut Overflow) -> anyhow::Result<Option<usize>> {
    let Some((header, items, text)) = extended_event_fields(d) else { return Ok(None) };

    let mut inner = header.to_vec();
    inner.extend_from_slice(items);
    let room = EXTENDED_EVENT_MAX_LEN.saturating_sub(inner.len() + 1);
    recode_text(&mut inner, text, room, Some(overflow));
    if inner.len() > 0xFF {
        anyhow::bail!("recoded extended event descriptor is {} bytes long", inner.len());
    }

    out.push(DESC_EXTENDED_EVENT);
    out.push(inner.len() as u8);
    let at = out.len();
    out.extend(inner);
    Ok(Some(at))
}

/// Carry what is still in `overflow` in one more extended event descriptor,
/// renumbering the earlier ones so `last_descriptor_number` stays coherent.
fn flush_overflow(out: &mut Vec<u8>, numbered: &[usize], overflow: &mut Overflow) {
    let Some(&last_at) = numbered.last() else { return };
    let next = (out[last_at] >> 4) + 1;
    if next > 0x0F {
        debug!(dropped = overflow.len(), "no descriptor number left for text overflow");
        overflow.take();
        return;
    }
    let lang = [out[last_at + 1], out[last_at + 2], out[last_at + 3]];
    for &at in numbered {
        out[at] = (out[at] & 0xF0) | next;
    }

    let mut inner = vec![(next << 4) | next];
    inner.extend_from_slice(&lang);
    inner.push(0); // no items
    recode_text(&mut inner, &[], EXTENDED_EVENT_MAX_LEN - 5 - 1, Some(overflow));
    out.push(DESC_EXTENDED_EVENT);
    out.push(inner.len() as u8);
    out.extend(inner);
}

/// Copy an event descriptor loop, recoding event text when `recode` is set.
pub fn copy_event_descriptors(src: &[u8], recode: bool) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len() + 16);
    let mut overflow = Overflow::default();
    let mut numbered = Vec::new();

    for (tag, d) in descriptors(src) {
        let done = match (recode, tag) {
            (true, DESC_SHORT_EVENT) => short_event(&mut out, d).is_some(),
            (true, DESC_EXTENDED_EVENT) => match extended_event(&mut out, d, &mut overflow)? {
                Some(at) => { numbered.push(at); true }
                None => false,
            },
            _ => false,
        };
        if !done {
            out.extend_from_slice(d);
        }
    }
    if !overflow.is_empty() {
        flush_overflow(&mut out, &numbered, &mut overflow);
    }
    Ok(out)
}

/// Rewrite an EIT p/f actual section of `old_service_id` for the output.
///
/// `Ok(None)` means the section belongs to another service (or is another
/// table) and must not be forwarded.
pub fn rewrite_eit_pf(section: &[u8], old_service_id: u16, ids: EitIds, recode: bool)
    -> anyhow::Result<Option<Section>>
{
    let sec = SectionReader::new(section)?;
    if sec.table_id != TID_EIT_PF_ACTUAL || sec.table_ext != old_service_id {
        return Ok(None);
    }
    let b = sec.body;
    if b.len() < EIT_HEADER_LEN - 8 {
        anyhow::bail!("EIT body too short");
    }

    let mut out = SectionBuilder::from_header(section, ids.service_id)?;
    out.u16(ids.transport_stream_id).u16(ids.original_network_id);
    out.bytes(&b[4..6]); // segment_last_section_number, last_table_id

    let events = &b[6..];
    if events.len() >= EVENT_FIXED_LEN + 2 {
        let fixed = &events[..EVENT_FIXED_LEN];
        let flags = events[EVENT_FIXED_LEN];
        let loop_len = (((flags & 0x0F) as usize) << 8) | events[EVENT_FIXED_LEN + 1] as usize;
        let start = EVENT_FIXED_LEN + 2;
        let end = start + loop_len;
        if end > events.len() {
            anyhow::bail!("EIT event descriptor loop runs past the section");
        }
        if end < events.len() {
            debug!(service_id = old_service_id, extra_bytes = events.len() - end, "dropping events after the first");
        }
        let running_status = flags >> 5;
        let new_loop = copy_event_descriptors(&events[start..end], recode)?;
        if new_loop.len() > 0x0FFF {
            anyhow::bail!("rewritten EIT descriptor loop too long ({} bytes)", new_loop.len());
        }

        out.bytes(fixed);
        // free_CA_mode 0
        out.u16(((running_status as u16) << 13) | new_loop.len() as u16);
        out.bytes(&new_loop);
    }
    out.finish().map(Some)
}
