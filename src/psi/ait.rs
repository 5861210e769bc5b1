// psi/ait.rs
//! Application Information Table (TS 102 809) for one HbbTV application
//! loaded over HTTP.

use crate::constants::TID_AIT;
use crate::psi::section::{Section, SectionBuilder};

const ORGANISATION_ID: u32 = 0x13;
const APPLICATION_ID: u16 = 0x0001;
const CONTROL_AUTOSTART: u8 = 0x01;
const PROTOCOL_HTTP: u16 = 0x0003;
const APPLICATION_NAME: &[u8] = b"hbbtv application";

const DESC_APPLICATION: u8 = 0x00;
const DESC_APPLICATION_NAME: u8 = 0x01;
const DESC_TRANSPORT_PROTOCOL: u8 = 0x02;
const DESC_SIMPLE_LOCATION: u8 = 0x15;

/// The broadcast-related application signalled next to a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AitApplication {
    pub application_type: u16,
    pub version:          u8,
    pub url:              String,
    pub initial_path:     String,
}

fn short_string(b: &mut SectionBuilder, what: &str, s: &[u8]) -> anyhow::Result<()> {
    let Ok(len) = u8::try_from(s.len()) else {
        anyhow::bail!("AIT {what} is {} bytes, at most 255 fit", s.len());
    };
    b.u8(len).bytes(s);
    Ok(())
}

pub fn build_ait(app: &AitApplication) -> anyhow::Result<Section> {
    let mut b = SectionBuilder::new(TID_AIT, 0xF0, app.application_type, app.version);
    b.u16(0xF000); // no common descriptors
    let apps = b.open_length(0xF0);

    b.u32(ORGANISATION_ID).u16(APPLICATION_ID).u8(CONTROL_AUTOSTART);
    let descs = b.open_length(0xF0);

    b.u8(DESC_TRANSPORT_PROTOCOL);
    let at = b.open_u8_length();
    b.u16(PROTOCOL_HTTP).u8(0); // transport_protocol_label
    short_string(&mut b, "URL", app.url.as_bytes())?;
    b.u8(0); // URL_extension_count
    b.close_u8_length(at)?;

    b.u8(DESC_APPLICATION);
    let at = b.open_u8_length();
    b.u8(5);                    // application_profiles_length
    b.u16(0x0001);              // basic profile
    b.u8(0).u8(5).u8(0);        // version 0.5.0
    b.u8((0x3 << 5) | 0x1F);    // not service bound, visible to all
    b.u8(2);                    // application_priority
    b.u8(0);                    // transport_protocol_label
    b.close_u8_length(at)?;

    b.u8(DESC_APPLICATION_NAME);
    let at = b.open_u8_length();
    b.bytes(b"eng");
    short_string(&mut b, "name", APPLICATION_NAME)?;
    b.close_u8_length(at)?;

    b.u8(DESC_SIMPLE_LOCATION);
    short_string(&mut b, "initial path", app.initial_path.as_bytes())?;

    b.close_length(descs);
    b.close_length(apps);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::descriptors;
    use crate::psi::section::SectionReader;
    use pretty_assertions::assert_eq;

    fn app() -> AitApplication {
        AitApplication {
            application_type: 0x0010,
            version:          1,
            url:              "http://example.org/hbbtv/".into(),
            initial_path:     "index.html".into(),
        }
    }

    #[test]
    fn layout() {
        let s = build_ait(&app()).unwrap();
        let r = SectionReader::new(&s.data).unwrap();
        assert_eq!(r.table_id, TID_AIT);
        assert_eq!(r.table_ext, 0x0010);
        assert_eq!(r.version, 1);

        let b = r.body;
        assert_eq!(&b[..2], &[0xF0, 0x00]);
        let apps_len = (((b[2] & 0x0F) as usize) << 8) | b[3] as usize;
        assert_eq!(apps_len, b.len() - 4);
        assert_eq!(&b[4..11], &[0, 0, 0, 0x13, 0, 1, CONTROL_AUTOSTART]);
        let loop_len = (((b[11] & 0x0F) as usize) << 8) | b[12] as usize;
        assert_eq!(loop_len, b.len() - 13);

        let ds: Vec<_> = descriptors(&b[13..]).collect();
        let tags: Vec<u8> = ds.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![DESC_TRANSPORT_PROTOCOL, DESC_APPLICATION, DESC_APPLICATION_NAME, DESC_SIMPLE_LOCATION]);

        let tp = ds[0].1;
        assert_eq!(&tp[2..5], &[0x00, 0x03, 0x00]);
        assert_eq!(tp[5] as usize, app().url.len());
        assert_eq!(&tp[6..6 + tp[5] as usize], app().url.as_bytes());
        assert_eq!(ds[1].1[1], 9);
        assert_eq!(&ds[2].1[2..6], b"eng\x11");
        assert_eq!(&ds[3].1[2..], b"index.html");
    }

    #[test]
    fn overlong_url_is_rejected() {
        let a = AitApplication { url: "x".repeat(300), ..app() };
        assert!(build_ait(&a).is_err());
    }
}
