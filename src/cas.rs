//! Pluggable Conditional Access System identification layer: decides
//! which CA descriptors, entitlement messages, and CAM responses belong
//! to an actively-bound CAID.

use crate::psi::CaDescriptor;

/// A CAS plugin's constructor receives the CAID it's being asked to
/// bind to and the optional `cas_data` hex blob from configuration.
pub trait CasPlugin: Send {
    fn matches_caid(&self, caid: u16) -> bool;
    fn check_descriptor(&self, desc: &CaDescriptor<'_>) -> bool;
    fn check_em(&self, em: &[u8]) -> bool;
    fn check_keys(&self, response: &[u8]) -> bool;
}

/// One entry in the static registration list: tries to construct a
/// plugin bound to `caid`, succeeding only if this CAS family recognizes
/// the identifier.
pub type CasConstructor = fn(caid: u16, cas_data: Option<&[u8]>) -> Option<Box<dyn CasPlugin>>;

/// A trivial fixed-key CAS that accepts exactly one CAID and never
/// rejects an ECM/EMM/response by content — used for BISS and as the
/// reference stub the example scenarios exercise.
pub struct PassthroughCas {
    caid: u16,
}

impl PassthroughCas {
    pub fn construct(caid: u16, _cas_data: Option<&[u8]>) -> Option<Box<dyn CasPlugin>> {
        if caid == crate::constants::BISS_CAID {
            Some(Box::new(PassthroughCas { caid }))
        } else {
            None
        }
    }
}

impl CasPlugin for PassthroughCas {
    fn matches_caid(&self, caid: u16) -> bool {
        caid == self.caid
    }

    fn check_descriptor(&self, _desc: &CaDescriptor<'_>) -> bool {
        true
    }

    fn check_em(&self, _em: &[u8]) -> bool {
        true
    }

    fn check_keys(&self, _response: &[u8]) -> bool {
        true
    }
}

/// CAID recognized by [`StubCas`], standing in for a real vendor CAS
/// implementation in the end-to-end scenarios.
pub const STUB_CAID: u16 = 0x4AE0;

/// A stub CAS matching exactly [`STUB_CAID`], accepting any
/// descriptor/EM/response addressed to it.
pub struct StubCas {
    caid: u16,
}

impl StubCas {
    pub fn construct(caid: u16, _cas_data: Option<&[u8]>) -> Option<Box<dyn CasPlugin>> {
        if caid == STUB_CAID {
            Some(Box::new(StubCas { caid }))
        } else {
            None
        }
    }
}

impl CasPlugin for StubCas {
    fn matches_caid(&self, caid: u16) -> bool {
        caid == self.caid
    }

    fn check_descriptor(&self, desc: &CaDescriptor<'_>) -> bool {
        desc.caid == self.caid
    }

    fn check_em(&self, em: &[u8]) -> bool {
        !em.is_empty()
    }

    fn check_keys(&self, response: &[u8]) -> bool {
        response.len() >= 11
    }
}

/// Static registration list, tried in order. The engine picks the first
/// plugin whose constructor succeeds for the active CAID.
pub const REGISTRY: &[CasConstructor] = &[PassthroughCas::construct, StubCas::construct];

/// Iterates the registry and returns the first matching CAS, or `None`
/// if no plugin claims this CAID (a fatal configuration error per the
/// engine's PAT handler).
pub fn cas_init(caid: u16, cas_data: Option<&[u8]>) -> Option<Box<dyn CasPlugin>> {
    REGISTRY.iter().find_map(|ctor| ctor(caid, cas_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biss_caid_resolves_to_passthrough() {
        let cas = cas_init(crate::constants::BISS_CAID, None).unwrap();
        assert!(cas.matches_caid(crate::constants::BISS_CAID));
    }

    #[test]
    fn stub_caid_resolves_to_stub() {
        let cas = cas_init(STUB_CAID, None).unwrap();
        assert!(cas.matches_caid(STUB_CAID));
        assert!(!cas.matches_caid(STUB_CAID + 1));
    }

    #[test]
    fn unknown_caid_has_no_plugin() {
        assert!(cas_init(0x0001, None).is_none());
    }
}
