//! Program Specific Information: section reassembly/CRC (generic), and the
//! PAT/CAT/PMT table parsers the demux dispatches to.

pub mod cat;
pub mod pat;
pub mod pmt;
pub mod section;

pub use cat::{ca_descriptors, cat_descriptor_loop, parse_cat, CaDescriptor, CatSection};
pub use pat::{first_program, parse_pat, PatEntry, PatSection};
pub use pmt::{parse_pmt, pmt_header, rewrite_pmt, PmtInfo, StreamInfo};
pub use section::{psi_calc_crc32, psi_emit, PsiBuffer, SectionReader};

/// The role a PID currently plays in the followed program, tracked by the
/// demux so an incoming TS packet can be dispatched without re-parsing PSI.
///
/// A PID has exactly one role at any time; transitions happen only as a
/// direct consequence of a PSI update (a new PAT/CAT/PMT version, or a
/// `stream_reload`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidRole {
    /// Not currently tracked by the engine.
    None,
    Pat,
    Cat,
    Pmt,
    /// ECM stream bound to a live `CaStream`.
    Ecm,
    /// EMM stream bound to a live `CaStream`.
    Emm,
    /// Seen in a CA_descriptor but not yet classified as ECM or EMM
    /// (CAID didn't match the active CAS, or the CAS declined it).
    Ca,
    /// Audio/video/data PID carrying scrambled or clear payload.
    ElementaryStream,
}

impl Default for PidRole {
    fn default() -> Self {
        PidRole::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_role_is_none() {
        assert_eq!(PidRole::default(), PidRole::None);
    }
}
