pub mod section;
pub mod pat;
pub mod pmt;
pub mod sdt;
pub mod nit;
pub mod eit;
pub mod ait;
pub mod text;

pub use section::{PushOutcome, Section, SectionAssembler, SectionBuilder, SectionReader};
pub use pat::{build_pat, parse_pat, PatEntry, PatSection};
pub use pmt::{assign_pids, build_pmt, parse_pmt, AitReference, PidAllocation, PmtSection};
pub use sdt::{build_sdt, parse_sdt, SdtRow, SdtSection, SdtService, ServiceDescription};
pub use nit::{build_nit, parse_nit, NitService};
pub use eit::{rewrite_eit_pf, EitIds};
pub use ait::{build_ait, AitApplication};

/// Walk a descriptor loop yielding `(tag, whole descriptor)`. Stops at the
/// first descriptor whose declared length runs past the loop.
pub fn descriptors(buf: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut idx = 0;
    std::iter::from_fn(move || {
        if idx + 2 > buf.len() { return None; }
        let end = idx + 2 + buf[idx + 1] as usize;
        if end > buf.len() { return None; }
        let d = &buf[idx..end];
        idx = end;
        Some((d[0], d))
    })
}
