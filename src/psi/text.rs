// psi/text.rs
//! DVB text field recoding.
//!
//! Some providers send ISO-8859-1 text without the character table prefix
//! (EN 300 468 annex A), so receivers fall back to the default table and
//! garble accented characters. We insert `0x10 0x00 0x01` in front of such
//! strings. When the marker pushes a field past its size limit the tail is
//! kept in an [`Overflow`] and emitted at the start of the next field.

use tracing::warn;

use crate::constants::TEXT_OVERFLOW_MAX;

pub const ISO_8859_1_MARKER: [u8; 3] = [0x10, 0x00, 0x01];

/// Text bytes pushed out of one field, waiting for the next one.
#[derive(Default, Debug)]
pub struct Overflow {
    buf: Vec<u8>,
}

impl Overflow {
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn take(&mut self) -> Vec<u8> { std::mem::take(&mut self.buf) }

    fn stash(&mut self, bytes: &[u8]) {
        if bytes.len() > TEXT_OVERFLOW_MAX {
            warn!(len = bytes.len(), "text overflow exceeds {TEXT_OVERFLOW_MAX} bytes, truncating");
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(TEXT_OVERFLOW_MAX)]);
    }
}

/// True if the first byte is printable, i.e. no character table was selected.
pub fn lacks_table_prefix(text: &[u8]) -> bool {
    text.first().is_some_and(|c| *c >= 0x20)
}

/// Append `text` as a length-prefixed field of at most `max_size` content bytes.
///
/// Without an `overflow` slot excess bytes are cut off; with one they are
/// kept for the next field.
pub fn recode_text(out: &mut Vec<u8>, text: &[u8], max_size: usize, overflow: Option<&mut Overflow>) {
    let carried = overflow.as_ref().is_some_and(|o| !o.is_empty());
    if text.is_empty() && !carried {
        out.push(0);
        return;
    }

    let mut content = Vec::with_capacity(text.len() + 3);
    if carried || lacks_table_prefix(text) {
        content.extend_from_slice(&ISO_8859_1_MARKER);
    }

    match overflow {
        Some(ov) => {
            // carried bytes first, then this field's own text
            let mut pending = ov.take();
            pending.extend_from_slice(text);
            let room = max_size.saturating_sub(content.len());
            if room == 0 {
                ov.stash(&pending);
                out.push(0);
                return;
            }
            let n = room.min(pending.len());
            content.extend_from_slice(&pending[..n]);
            if n < pending.len() {
                ov.stash(&pending[n..]);
            }
        }
        None => {
            content.extend_from_slice(text);
            if content.len() > max_size {
                warn!(len = content.len(), max_size, "recoded text too long, truncating");
                content.truncate(max_size);
            }
        }
    }
    out.push(content.len() as u8);
    out.extend_from_slice(&content);
}

/// Best-effort display form: table prefix dropped, bytes read as Latin-1.
pub fn decode_text(text: &[u8]) -> String {
    let body = match text.first() {
        Some(0x10) if text.len() >= 3 => &text[3..],
        Some(c) if *c < 0x20 => &text[1..],
        _ => text,
    };
    body.iter().map(|b| *b as char).collect()
}
