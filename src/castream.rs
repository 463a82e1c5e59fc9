//! Per-ECM-PID key-stream state: the odd/even control words, the batched
//! decrypt queue, and the pending-key handoff described by the decrypt
//! engine's batch scheduler.

use crate::constants::NULL_PID;
use crate::csa::{BatchSlot, CsaKey, BATCH_WIDTH};

/// Latched scrambling-control parity for a CaStream's current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Unknown,
    Even,
    Odd,
}

/// Which half of a pending control-word pair changed since the last
/// applied key, decided by [`crate::engine`]'s CAM response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKeyId {
    None,
    EvenOnly,
    OddOnly,
    Both,
}

/// One ECM/EMM-derived descrambling context. Created the first time an
/// ECM PID we can handle is discovered (or synthetically once, for BISS);
/// destroyed on `stream_reload` or engine shutdown.
pub struct CaStream {
    pub ecm_pid: u16,
    pub current_parity: Parity,
    pub even_key: Option<CsaKey>,
    pub odd_key: Option<CsaKey>,
    pub batch_slots: Vec<BatchSlot>,
    pub batch_skip: usize,
    /// Table_id (0x80/0x81) of the last ECM accepted, or 0 for "none yet".
    pub last_ecm_type: u8,
    pub pending_key_material: [u8; 16],
    pub pending_key_id: PendingKeyId,
}

impl CaStream {
    pub fn new(ecm_pid: u16) -> Self {
        Self {
            ecm_pid,
            current_parity: Parity::Unknown,
            even_key: None,
            odd_key: None,
            batch_slots: Vec::with_capacity(BATCH_WIDTH),
            batch_skip: 0,
            last_ecm_type: 0,
            pending_key_material: [0; 16],
            pending_key_id: PendingKeyId::None,
        }
    }

    /// Synthesizes a fixed-key BISS stream: ecm_pid is conventionally the
    /// NULL PID since BISS carries no real ECM.
    pub fn new_biss(even: [u8; 8], odd: [u8; 8]) -> Self {
        let mut stream = Self::new(NULL_PID);
        stream.even_key = Some(CsaKey::from_control_word(even));
        stream.odd_key = Some(CsaKey::from_control_word(odd));
        stream
    }

    pub fn queue_slot(&mut self, offset: usize, len: usize) {
        self.batch_slots.push(BatchSlot { offset, len });
        self.batch_skip += 1;
    }

    pub fn active_key(&self) -> Option<&CsaKey> {
        match self.current_parity {
            Parity::Even => self.even_key.as_ref(),
            Parity::Odd => self.odd_key.as_ref(),
            Parity::Unknown => None,
        }
    }

    /// Resets batch bookkeeping after a bulk decrypt, applies any pending
    /// key material queued by a CAM response, and clears the pending
    /// state. Must only be called at a batch boundary.
    pub fn finish_batch(&mut self) {
        self.batch_slots.clear();
        self.batch_skip = 0;
        self.current_parity = Parity::Unknown;

        match self.pending_key_id {
            PendingKeyId::None => {}
            PendingKeyId::EvenOnly => {
                self.even_key = Some(CsaKey::from_control_word(
                    self.pending_key_material[0..8].try_into().unwrap(),
                ));
            }
            PendingKeyId::OddOnly => {
                self.odd_key = Some(CsaKey::from_control_word(
                    self.pending_key_material[8..16].try_into().unwrap(),
                ));
            }
            PendingKeyId::Both => {
                self.even_key = Some(CsaKey::from_control_word(
                    self.pending_key_material[0..8].try_into().unwrap(),
                ));
                self.odd_key = Some(CsaKey::from_control_word(
                    self.pending_key_material[8..16].try_into().unwrap(),
                ));
            }
        }
        self.pending_key_id = PendingKeyId::None;
    }

    /// Clears batch and pending-key state without touching installed
    /// keys; used by `on_cam_error`.
    pub fn reset_batch_and_pending(&mut self) {
        self.batch_slots.clear();
        self.batch_skip = 0;
        self.current_parity = Parity::Unknown;
        self.pending_key_id = PendingKeyId::None;
        self.pending_key_material = [0; 16];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_batch_installs_pending_even_key() {
        let mut stream = CaStream::new(0x50);
        stream.pending_key_material[0..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        stream.pending_key_id = PendingKeyId::EvenOnly;
        stream.queue_slot(0, 184);
        stream.current_parity = Parity::Even;

        stream.finish_batch();

        assert!(stream.even_key.is_some());
        assert!(stream.odd_key.is_none());
        assert_eq!(stream.pending_key_id, PendingKeyId::None);
        assert_eq!(stream.batch_skip, 0);
        assert_eq!(stream.current_parity, Parity::Unknown);
    }

    #[test]
    fn reset_batch_and_pending_keeps_installed_keys() {
        let mut stream = CaStream::new(0x50);
        stream.even_key = Some(CsaKey::from_control_word([1; 8]));
        stream.pending_key_id = PendingKeyId::Both;
        stream.queue_slot(0, 10);

        stream.reset_batch_and_pending();

        assert!(stream.even_key.is_some());
        assert_eq!(stream.pending_key_id, PendingKeyId::None);
        assert_eq!(stream.batch_skip, 0);
    }
}
