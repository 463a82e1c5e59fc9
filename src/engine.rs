//! The decrypt engine: PSI-driven PID classification, CAM/CAS coupling,
//! and the double-buffered CSA batch scheduler described by `on_ts`.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::cam::{Cam, CaStreamCtx, CamResponse, DecryptHandle};
use crate::cas::{cas_init, CasPlugin};
use crate::castream::{CaStream, Parity, PendingKeyId};
use crate::config::DecryptConfig;
use crate::constants::{EM_MAX_SIZE, NULL_PID, TS_PACKET_SIZE};
use crate::csa::{decrypt_batch, BATCH_WIDTH};
use crate::psi::{
    first_program, parse_pat, psi_emit, rewrite_pmt, CaDescriptor, PatSection, PidRole, PsiBuffer,
};
use crate::ts::{ts_clear_scrambling, ts_payload_offset, ts_pid, ts_scrambling, Scrambling};

const PAT_PID: u16 = 0;
const CAT_PID: u16 = 1;

/// Tracks per-PID role plus the section reassembly buffer for PSI PIDs.
struct PidEntry {
    role: PidRole,
    section: PsiBuffer,
}

impl PidEntry {
    fn new(role: PidRole) -> Self {
        Self {
            role,
            section: PsiBuffer::new(),
        }
    }
}

/// Followed program state (§3 `DecryptState`).
struct DecryptState {
    pnr: Option<u16>,
    cas_pnr: Option<u16>,
    cas_data: Option<Vec<u8>>,
    caid: u16,
    cam: Option<Arc<dyn Cam>>,
    cas: Option<Box<dyn CasPlugin>>,
}

pub struct DecryptEngine {
    name: String,
    state: DecryptState,
    pids: HashMap<u16, PidEntry>,
    pmt_pid: Option<u16>,
    pmt_crc: Option<u32>,
    last_pmt_bytes: Option<Vec<u8>>,
    ca_streams: Vec<CaStream>,
    es_binding: HashMap<u16, usize>,
    ecm_pid_to_stream: HashMap<u16, usize>,

    recv: Vec<u8>,
    send: Option<Vec<u8>>,
    storage_skip: usize,

    decrypt_handle: DecryptHandle,
    cam_rx: Option<Receiver<CamResponse>>,
    out_cc: u8,
}

impl DecryptEngine {
    pub fn new(config: DecryptConfig) -> anyhow::Result<Self> {
        let mut engine = Self {
            name: config.name.clone(),
            state: DecryptState {
                pnr: None,
                cas_pnr: config.cas_pnr,
                cas_data: config.cas_data.clone(),
                caid: 0,
                cam: config.cam.clone(),
                cas: None,
            },
            pids: HashMap::new(),
            pmt_pid: None,
            pmt_crc: None,
            last_pmt_bytes: None,
            ca_streams: Vec::new(),
            es_binding: HashMap::new(),
            ecm_pid_to_stream: HashMap::new(),
            recv: vec![0u8; BATCH_WIDTH * TS_PACKET_SIZE],
            send: None,
            storage_skip: 0,
            decrypt_handle: DecryptHandle(0),
            cam_rx: None,
            out_cc: 0,
        };

        engine.pids.insert(PAT_PID, PidEntry::new(PidRole::Pat));

        if let Some((even, odd)) = config.biss_keys()? {
            engine.ca_streams.push(CaStream::new_biss(even, odd));
            let idx = engine.ca_streams.len() - 1;
            engine.ecm_pid_to_stream.insert(NULL_PID, idx);
            engine.log(&format!(
                "biss fixed-key stream installed ({} bytes even/odd)",
                even.len() + odd.len()
            ));
        }

        if let Some(cam) = &engine.state.cam {
            let (tx, rx) = std::sync::mpsc::channel();
            cam.attach_decrypt(engine.decrypt_handle, tx);
            engine.cam_rx = Some(rx);
        }

        Ok(engine)
    }

    fn log(&self, msg: &str) {
        eprintln!("[decrypt {}] {msg}", self.name);
    }

    fn cam_ready(&self) -> bool {
        self.state.cam.as_ref().map(|c| c.is_ready()).unwrap_or(false)
    }

    /// Processes one inbound 188-byte TS packet, producing zero or more
    /// output packets via `emit`.
    pub fn on_ts(&mut self, pkt: &[u8; TS_PACKET_SIZE], mut emit: impl FnMut(&[u8])) {
        self.drain_cam_responses();

        let pid = ts_pid(pkt);
        if pid == NULL_PID {
            return;
        }

        if pid == PAT_PID {
            self.feed_pat(pkt, &mut emit);
            return;
        }
        if pid == CAT_PID && self.pids.contains_key(&CAT_PID) {
            self.feed_cat(pkt, &mut emit);
            return;
        }

        if let Some(role) = self.pids.get(&pid).map(|e| e.role) {
            match role {
                PidRole::Pmt => self.feed_pmt(pid, pkt, &mut emit),
                PidRole::Ecm | PidRole::Emm => self.feed_em(pid, pkt),
                PidRole::Ca => {} // unselected CA PID: drop
                _ => {}
            }
            return;
        }

        if self.ca_streams.is_empty() {
            emit(pkt);
            return;
        }

        self.queue_or_forward(pid, pkt, &mut emit);
    }

    fn drain_cam_responses(&mut self) {
        let Some(rx) = &self.cam_rx else { return };
        let mut responses = Vec::new();
        while let Ok(resp) = rx.try_recv() {
            responses.push(resp);
        }
        for resp in responses {
            self.on_cam_response(resp);
        }
    }

    // ---- PSI handlers (§4.2) ----------------------------------------

    fn feed_pat(&mut self, pkt: &[u8; TS_PACKET_SIZE], _emit: &mut impl FnMut(&[u8])) {
        let payload_start = match ts_payload_offset(pkt) {
            Some(o) => o,
            None => return,
        };
        let entry = self.pids.get_mut(&PAT_PID).unwrap();
        let Some(section) = entry.section.feed(pkt, &pkt[payload_start..]) else {
            return;
        };
        let crc = crc_of(&section);
        let last_crc = entry.section.last_crc;
        if last_crc == Some(crc) {
            return;
        }
        if last_crc.is_some() {
            self.stream_reload();
        }
        let entry = self.pids.get_mut(&PAT_PID).unwrap();
        entry.section.last_crc = Some(crc);

        let pat: PatSection = match parse_pat(&section) {
            Ok(p) => p,
            Err(e) => {
                self.log(&format!("malformed PAT: {e}"));
                return;
            }
        };
        let Some(chosen) = first_program(&pat) else {
            self.log("PAT has no non-zero program_number entry");
            return;
        };
        self.state.pnr = Some(chosen.program_number);
        self.pmt_pid = Some(chosen.pmt_pid);
        self.pids.insert(chosen.pmt_pid, PidEntry::new(PidRole::Pmt));

        if self.cam_ready() {
            self.pids.insert(CAT_PID, PidEntry::new(PidRole::Cat));
            let caid = self.state.caid;
            if caid != 0 {
                match cas_init(caid, self.state.cas_data.as_deref()) {
                    Some(cas) => self.state.cas = Some(cas),
                    None => {
                        self.log(&format!("fatal: no CAS plugin matches caid {caid:#06x}"));
                        panic!("[decrypt {}] no CAS matches caid {caid:#06x}", self.name);
                    }
                }
            }
        }
    }

    fn feed_cat(&mut self, pkt: &[u8; TS_PACKET_SIZE], _emit: &mut impl FnMut(&[u8])) {
        let payload_start = match ts_payload_offset(pkt) {
            Some(o) => o,
            None => return,
        };
        let entry = self.pids.get_mut(&CAT_PID).unwrap();
        let Some(section) = entry.section.feed(pkt, &pkt[payload_start..]) else {
            return;
        };
        let crc = crc_of(&section);
        let first_version = entry.section.last_crc.is_none();
        if !first_version {
            if entry.section.last_crc != Some(crc) {
                self.stream_reload();
            }
            return;
        }
        self.pids.get_mut(&CAT_PID).unwrap().section.last_crc = Some(crc);

        let body = match crate::psi::cat_descriptor_loop(&section) {
            Ok(b) => b,
            Err(e) => {
                self.log(&format!("malformed CAT: {e}"));
                return;
            }
        };

        let disable_emm = self.state.cam.as_ref().map(|c| c.disable_emm()).unwrap_or(false);
        let active_caid = self.state.caid;
        let descriptors: Vec<CaDescriptor> = crate::psi::ca_descriptors(body).collect();
        let mut selected_any = false;

        for desc in descriptors {
            if desc.ca_pid == NULL_PID {
                continue;
            }
            if let Some(existing) = self.pids.get(&desc.ca_pid) {
                if !matches!(existing.role, PidRole::Ca) {
                    self.log(&format!("CAT: pid {:#x} already has a non-CA role", desc.ca_pid));
                    continue;
                }
            } else {
                self.pids.insert(desc.ca_pid, PidEntry::new(PidRole::Ca));
            }

            let accepted = self.state.cas.as_ref().map_or(false, |cas| {
                desc.caid == active_caid && cas.check_descriptor(&desc)
            });
            if !accepted {
                continue;
            }
            if disable_emm {
                continue; // section allocated above, but no promotion
            }
            self.pids.get_mut(&desc.ca_pid).unwrap().role = PidRole::Emm;
            self.log(&format!("CAT: selected EMM pid {:#x}", desc.ca_pid));
            selected_any = true;
        }

        if !selected_any {
            self.log("CAT: no EMM pid selected");
        }
    }

    fn feed_pmt(&mut self, pid: u16, pkt: &[u8; TS_PACKET_SIZE], mut emit: &mut impl FnMut(&[u8])) {
        let payload_start = match ts_payload_offset(pkt) {
            Some(o) => o,
            None => return,
        };
        let entry = self.pids.get_mut(&pid).unwrap();
        let Some(section) = entry.section.feed(pkt, &pkt[payload_start..]) else {
            return;
        };

        let (table_id, program_number) = match crate::psi::pmt_header(&section) {
            Ok(h) => h,
            Err(e) => {
                self.log(&format!("malformed PMT: {e}"));
                return;
            }
        };
        if table_id != 0x02 || Some(program_number) != self.state.pnr {
            return;
        }

        let crc = crc_of(&section);
        if self.pmt_crc == Some(crc) {
            if let Some(bytes) = self.last_pmt_bytes.clone() {
                psi_emit(pid, &bytes, &mut self.out_cc, |p| emit(&p));
            }
            return;
        }
        let first_version = self.pmt_crc.is_none();
        if !first_version {
            self.stream_reload();
            return;
        }
        self.pmt_crc = Some(crc);

        let active_caid = self.state.caid;

        let ca_streams = &mut self.ca_streams;
        let ecm_pid_to_stream = &mut self.ecm_pid_to_stream;
        let es_binding = &mut self.es_binding;
        let pids = &mut self.pids;
        let cas = &self.state.cas;
        let log_name = self.name.clone();

        let rewrite_result = rewrite_pmt(pid, &section, |desc: CaDescriptor, already_selected, es_pid_ctx| {
            if desc.ca_pid == NULL_PID {
                return false;
            }
            if let Some(existing) = pids.get(&desc.ca_pid) {
                if !matches!(existing.role, PidRole::Ca | PidRole::Ecm) {
                    eprintln!(
                        "[decrypt {log_name}] PMT: pid {:#x} already has a non-CA role",
                        desc.ca_pid
                    );
                    return false;
                }
            } else {
                pids.insert(desc.ca_pid, PidEntry::new(PidRole::Ca));
            }

            let accepted =
                cas.as_ref().map_or(false, |c| desc.caid == active_caid && c.check_descriptor(&desc));
            if !accepted {
                return false;
            }
            if already_selected {
                eprintln!(
                    "[decrypt {log_name}] PMT: extra ECM pid {:#x} ignored (already selected)",
                    desc.ca_pid
                );
                return false;
            }

            let stream_idx = *ecm_pid_to_stream.entry(desc.ca_pid).or_insert_with(|| {
                ca_streams.push(CaStream::new(desc.ca_pid));
                ca_streams.len() - 1
            });
            pids.get_mut(&desc.ca_pid).unwrap().role = PidRole::Ecm;
            if let Some(es_pid) = es_pid_ctx {
                es_binding.insert(es_pid, stream_idx);
            }
            eprintln!("[decrypt {log_name}] PMT: selected ECM pid {:#x}", desc.ca_pid);
            true
        });

        match rewrite_result {
            Ok((_info, bytes)) => {
                self.last_pmt_bytes = Some(bytes.clone());
                psi_emit(pid, &bytes, &mut self.out_cc, |p| emit(&p));
            }
            Err(e) => self.log(&format!("PMT rewrite failed: {e}")),
        }
    }

    fn feed_em(&mut self, pid: u16, pkt: &[u8; TS_PACKET_SIZE]) {
        let payload_start = match ts_payload_offset(pkt) {
            Some(o) => o,
            None => return,
        };
        let entry = self.pids.get_mut(&pid).unwrap();
        let Some(section) = entry.section.feed(pkt, &pkt[payload_start..]) else {
            return;
        };
        self.on_em(pid, &section);
    }

    /// §4.3: entitlement-message dispatch.
    fn on_em(&mut self, pid: u16, section: &[u8]) {
        if !self.cam_ready() {
            return;
        }
        if section.len() > EM_MAX_SIZE {
            self.log("EM too large, dropped");
            return;
        }
        let Some(&table_id) = section.first() else {
            return;
        };

        match table_id {
            0x80 | 0x81 => {
                let Some(&idx) = self.ecm_pid_to_stream.get(&pid) else {
                    return;
                };
                let stream = &mut self.ca_streams[idx];
                if stream.last_ecm_type == table_id {
                    return; // duplicate parity
                }
                let accepted = self
                    .state
                    .cas
                    .as_ref()
                    .map_or(false, |cas| cas.check_em(section));
                if !accepted {
                    return;
                }
                stream.last_ecm_type = table_id;
                if let Some(cam) = &self.state.cam {
                    cam.send_em(self.decrypt_handle, CaStreamCtx::EcmPid(pid), section);
                }
            }
            0x82..=0x8F => {
                let disable_emm = self.state.cam.as_ref().map(|c| c.disable_emm()).unwrap_or(false);
                if disable_emm {
                    return;
                }
                let accepted = self
                    .state
                    .cas
                    .as_ref()
                    .map_or(false, |cas| cas.check_em(section));
                if accepted {
                    if let Some(cam) = &self.state.cam {
                        cam.send_em(self.decrypt_handle, CaStreamCtx::None, section);
                    }
                }
            }
            other => self.log(&format!("wrong-type EM table_id {other:#04x}")),
        }
    }

    /// §4.4: CAM response handler.
    fn on_cam_response(&mut self, resp: CamResponse) {
        if resp.error.is_some() {
            self.log(&format!("CAM error: {}", resp.error.unwrap()));
            return;
        }
        let data = &resp.payload;
        if data.is_empty() || data[0] & 0xFE != 0x80 {
            return; // EMM acknowledgment
        }
        if self.state.cas.is_none() {
            return; // CAS unbound after a reload
        }
        let CaStreamCtx::EcmPid(ecm_pid) = resp.ctx else {
            return;
        };
        let Some(&idx) = self.ecm_pid_to_stream.get(&ecm_pid) else {
            return;
        };

        if data.len() < 19 || data[2] != 16 {
            self.log("CAM response: bad length");
            return;
        }
        if (data[3].wrapping_add(data[4]).wrapping_add(data[5])) & 0xFF != data[6] {
            self.log("CAM response: even checksum mismatch");
            return;
        }
        if (data[7].wrapping_add(data[8]).wrapping_add(data[9])) & 0xFF != data[10] {
            self.log("CAM response: even checksum mismatch");
            return;
        }
        if !self.state.cas.as_ref().unwrap().check_keys(data) {
            self.log("CAM response: rejected by CAS");
            return;
        }

        let new_even: [u8; 8] = data[3..11].try_into().unwrap();
        let new_odd: [u8; 8] = data[11..19].try_into().unwrap();
        let stream = &mut self.ca_streams[idx];

        let even_unchanged = stream
            .even_key
            .as_ref()
            .is_some_and(|k| k.control_word() == new_even);
        let odd_unchanged = stream
            .odd_key
            .as_ref()
            .is_some_and(|k| k.control_word() == new_odd);

        stream.pending_key_id = match (even_unchanged, odd_unchanged) {
            (true, false) => PendingKeyId::OddOnly,
            (false, true) => PendingKeyId::EvenOnly,
            _ => PendingKeyId::Both,
        };
        match stream.pending_key_id {
            PendingKeyId::EvenOnly => stream.pending_key_material[0..8].copy_from_slice(&new_even),
            PendingKeyId::OddOnly => stream.pending_key_material[8..16].copy_from_slice(&new_odd),
            PendingKeyId::Both => stream.pending_key_material.copy_from_slice(&data[3..19]),
            PendingKeyId::None => {}
        }
    }

    // ---- CAM lifecycle callbacks (§4.7) ------------------------------

    pub fn on_cam_ready(&mut self, caid: u16) {
        self.state.caid = caid;
        self.stream_reload();
    }

    pub fn on_cam_error(&mut self) {
        self.state.caid = 0;
        self.state.cas = None;
        for stream in &mut self.ca_streams {
            stream.reset_batch_and_pending();
        }
    }

    /// §4.2 `stream_reload`: clears PAT CRC, destroys every other PSI
    /// section and the CAS; CaStreams and buffers survive.
    fn stream_reload(&mut self) {
        self.log("stream_reload");
        if let Some(pat_entry) = self.pids.get_mut(&PAT_PID) {
            pat_entry.section.reset();
        }
        self.pids.retain(|&pid, _| pid == PAT_PID);
        self.pmt_crc = None;
        self.last_pmt_bytes = None;
        self.pmt_pid = None;
        self.state.cas = None;
    }

    // ---- batch scheduler (§4.5) --------------------------------------

    fn queue_or_forward(&mut self, pid: u16, pkt: &[u8; TS_PACKET_SIZE], mut emit: &mut impl FnMut(&[u8])) {
        let base = self.storage_skip;
        self.recv[base..base + TS_PACKET_SIZE].copy_from_slice(pkt);

        let scrambling = ts_scrambling(pkt);
        if scrambling.is_scrambled() {
            if let Some(offset) = ts_payload_offset(pkt) {
                let stream_idx = self
                    .es_binding
                    .get(&pid)
                    .copied()
                    .or(if self.ca_streams.is_empty() { None } else { Some(0) });

                if let Some(stream_idx) = stream_idx {
                    let dst = &mut self.recv[base..base + TS_PACKET_SIZE];
                    let stream = &mut self.ca_streams[stream_idx];
                    if stream.current_parity == Parity::Unknown {
                        stream.current_parity = match scrambling {
                            Scrambling::Even => Parity::Even,
                            Scrambling::Odd => Parity::Odd,
                            _ => Parity::Unknown,
                        };
                    }
                    ts_clear_scrambling(dst);
                    stream.queue_slot(base + offset, TS_PACKET_SIZE - offset);
                }
            }
        }

        if let Some(send) = &self.send {
            emit(&send[base..base + TS_PACKET_SIZE]);
        }

        self.storage_skip += TS_PACKET_SIZE;
        if self.storage_skip >= BATCH_WIDTH * TS_PACKET_SIZE {
            self.flip_batch();
        }
    }

    fn flip_batch(&mut self) {
        for stream in &mut self.ca_streams {
            if stream.batch_skip > 0 {
                if let Some(key) = stream.active_key() {
                    decrypt_batch(key, &mut self.recv, &stream.batch_slots);
                }
            }
            stream.finish_batch();
        }

        if self.send.is_none() {
            self.send = Some(vec![0u8; BATCH_WIDTH * TS_PACKET_SIZE]);
        }
        std::mem::swap(&mut self.recv, self.send.as_mut().unwrap());
        self.storage_skip = 0;
    }

    /// Flushes whatever is currently sitting in `send` without waiting for
    /// another full batch; used by callers that need all accepted input
    /// echoed before shutdown.
    pub fn shutdown(&mut self) {
        if let Some(cam) = &self.state.cam {
            cam.detach_decrypt(self.decrypt_handle);
        }
        self.ca_streams.clear();
        self.state.cas = None;
        self.pids.clear();
    }
}

fn crc_of(section: &[u8]) -> u32 {
    crate::psi::psi_calc_crc32(&section[..section.len() - crate::constants::CRC32_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csa::CW_LEN;

    fn clear_packet(pid: u16, fill: u8) -> [u8; TS_PACKET_SIZE] {
        let mut p = [fill; TS_PACKET_SIZE];
        p[0] = crate::constants::TS_SYNC_BYTE;
        p[1] = ((pid >> 8) as u8) & 0x1F;
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10; // payload-only, no scrambling
        p
    }

    #[test]
    fn clear_pass_through_is_byte_identical() {
        let mut engine = DecryptEngine::new(DecryptConfig::new("test")).unwrap();
        let pkt = clear_packet(0x100, 0xAB);
        let mut outputs = Vec::new();
        for _ in 0..10 {
            engine.on_ts(&pkt, |p| outputs.push(p.to_vec()));
        }
        assert_eq!(outputs.len(), 10);
        for out in &outputs {
            assert_eq!(out.as_slice(), &pkt[..]);
        }
    }

    #[test]
    fn biss_scrambled_packets_clear_after_one_batch() {
        let cfg = DecryptConfig::new("test").with_biss("1122330044556600");
        let mut engine = DecryptEngine::new(cfg).unwrap();

        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = crate::constants::TS_SYNC_BYTE;
        pkt[1] = ((0x200u16 >> 8) as u8) & 0x1F;
        pkt[2] = (0x200u16 & 0xFF) as u8;
        pkt[3] = 0b10 << 6 | 0x10; // even scrambling, payload-only
        for b in pkt[4..].iter_mut() {
            *b = 0x5A;
        }

        let mut outputs = Vec::new();
        for _ in 0..BATCH_WIDTH {
            engine.on_ts(&pkt, |p| outputs.push(p.to_vec()));
        }
        // first batch's worth is still in-flight (emitted from `send`,
        // which does not exist yet)
        assert!(outputs.is_empty());

        for _ in 0..BATCH_WIDTH {
            engine.on_ts(&pkt, |p| outputs.push(p.to_vec()));
        }
        assert_eq!(outputs.len(), BATCH_WIDTH);
        for out in &outputs {
            assert_eq!(out[3] & 0xC0, 0, "scrambling bits must be cleared");
        }
    }

    #[test]
    fn null_pid_packets_are_dropped() {
        let mut engine = DecryptEngine::new(DecryptConfig::new("test")).unwrap();
        let pkt = clear_packet(NULL_PID, 0xFF);
        let mut outputs = Vec::new();
        engine.on_ts(&pkt, |p| outputs.push(p.to_vec()));
        assert!(outputs.is_empty());
    }

    #[test]
    fn cw_len_matches_control_word_size() {
        assert_eq!(CW_LEN, 8);
    }
}
