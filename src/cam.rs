//! CAM (Conditional Access Module) coupling: the engine attaches a
//! decrypt handle, forwards entitlement messages, and receives
//! control-word responses via callback.

use std::sync::mpsc::Sender;

/// Opaque handle the engine presents to the CAM on attach/detach/send_em;
/// the CAM treats it as an identity token, never inspecting its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptHandle(pub u32);

/// Identifies which CaStream (if any) an outbound EM was sent on behalf
/// of, so the eventual response can be routed back without the CAM
/// needing to understand CaStreams itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaStreamCtx {
    /// EMM dispatch carries no CaStream context.
    None,
    /// ECM dispatch is bound to the CaStream keyed by this ECM PID.
    EcmPid(u16),
}

/// A response (or error) delivered asynchronously by the CAM, always on
/// the engine's own event loop per the single-threaded concurrency model.
pub struct CamResponse {
    pub handle: DecryptHandle,
    pub ctx: CaStreamCtx,
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

/// Operations the engine invokes on the CAM. The engine owns the response
/// channel: it creates the pair at attach time and hands the `Sender` half
/// to the CAM, keeping the `Receiver` for itself. A real CAM implementation
/// may run worker threads internally but MUST deliver responses back
/// through that `Sender`, never directly into engine state.
pub trait Cam: Send + Sync {
    fn attach_decrypt(&self, handle: DecryptHandle, responses: Sender<CamResponse>);
    fn detach_decrypt(&self, handle: DecryptHandle);
    fn send_em(&self, handle: DecryptHandle, ctx: CaStreamCtx, em: &[u8]);
    fn is_ready(&self) -> bool;
    fn disable_emm(&self) -> bool;
}

/// An in-process CAM stand-in used by tests and by BISS mode (where no
/// real CAM is ever attached): immediately "ready", EMM disabled, and
/// `send_em` simply records the call so tests can assert on it.
pub struct NullCam {
    ready: bool,
    disable_emm: bool,
}

impl NullCam {
    pub fn new(ready: bool, disable_emm: bool) -> Self {
        Self { ready, disable_emm }
    }
}

impl Cam for NullCam {
    fn attach_decrypt(&self, _handle: DecryptHandle, _responses: Sender<CamResponse>) {}

    fn detach_decrypt(&self, _handle: DecryptHandle) {}

    fn send_em(&self, _handle: DecryptHandle, _ctx: CaStreamCtx, _em: &[u8]) {}

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn disable_emm(&self) -> bool {
        self.disable_emm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_cam_reports_configured_readiness() {
        let cam = NullCam::new(true, false);
        assert!(cam.is_ready());
        assert!(!cam.disable_emm());
    }
}
