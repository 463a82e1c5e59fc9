// psi/section.rs
//! Generic PSI section reassembly, CRC-32 (MPEG-2) validation, and re-emission.

use crc::{Crc, CRC_32_MPEG_2};

use crate::constants::{CRC32_SIZE, PSI_MAX_SIZE, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::ts::ts_payload_unit_start;

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// A parsed, CRC-validated view into a reassembled section's bytes.
pub struct SectionReader<'a> {
    pub table_id: u8,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section: u8,
    pub program_number: u16,
    /// Bytes between the fixed 8-byte header and the trailing CRC.
    pub body: &'a [u8],
}

impl<'a> SectionReader<'a> {
    /// Validates pointer, length and CRC-32 of a section carried in a
    /// `payload[0] == pointer_field` framed single-packet TS payload.
    pub fn new(payload: &'a [u8]) -> anyhow::Result<Self> {
        if payload.is_empty() {
            anyhow::bail!("payload empty");
        }
        let pointer = payload[0] as usize;
        let start = 1 + pointer;
        if payload.len() < start + 8 {
            anyhow::bail!("short section");
        }

        let sec_len = ((payload[start + 1] & 0x0F) as usize) << 8 | payload[start + 2] as usize;
        if sec_len < 5 {
            anyhow::bail!("invalid section_length");
        }
        let end = start + 3 + sec_len;
        if end > payload.len() {
            anyhow::bail!("truncated section");
        }

        Self::from_section_bytes(&payload[start..end])
    }

    /// Parses an already-reassembled section (table_id .. CRC inclusive),
    /// as produced by [`PsiBuffer::feed`].
    pub fn from_section_bytes(section: &'a [u8]) -> anyhow::Result<Self> {
        if section.len() < 8 + CRC32_SIZE {
            anyhow::bail!("short section");
        }
        let end = section.len();
        let crc_calc = CRC_MPEG.checksum(&section[..end - CRC32_SIZE]);
        let crc_pkt = u32::from_be_bytes(section[end - CRC32_SIZE..end].try_into()?);
        if crc_calc != crc_pkt {
            anyhow::bail!("CRC-32 mismatch");
        }

        Ok(Self {
            table_id: section[0],
            version: (section[5] & 0x3E) >> 1,
            current_next: section[5] & 0x01 != 0,
            section_number: section[6],
            last_section: section[7],
            program_number: u16::from_be_bytes(section[3..5].try_into()?),
            body: &section[8..end - CRC32_SIZE],
        })
    }
}

/// Computes the CRC-32/MPEG-2 over a section's bytes (table_id .. last
/// content byte before the CRC field itself).
pub fn psi_calc_crc32(section: &[u8]) -> u32 {
    CRC_MPEG.checksum(section)
}

/// Reassembly buffer for one PID carrying PSI. Tracks the CRC of the last
/// accepted section so repeated feeds of an unchanged table are cheap to
/// detect (`psi_feed`'s job), and accumulates payload bytes across TS
/// packets sharing a PID until a full section is available.
#[derive(Default)]
pub struct PsiBuffer {
    pub last_crc: Option<u32>,
    buf: Vec<u8>,
    want: Option<usize>,
}

impl PsiBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears reassembly state and the remembered CRC (used by
    /// `stream_reload`).
    pub fn reset(&mut self) {
        self.last_crc = None;
        self.buf.clear();
        self.want = None;
    }

    /// Feeds one TS packet's payload bytes for this PID. Returns the
    /// reassembled section bytes (table_id..CRC inclusive) once a complete
    /// section has arrived. Malformed partial data is dropped silently;
    /// the next `payload_unit_start` resynchronizes reassembly.
    pub fn feed(&mut self, pkt: &[u8], payload: &[u8]) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return None;
        }

        if ts_payload_unit_start(pkt) {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                self.want = None;
                self.buf.clear();
                return None;
            }
            self.buf.clear();
            self.buf.extend_from_slice(&payload[1 + pointer..]);
            self.want = None;
        } else {
            if self.want.is_none() && self.buf.is_empty() {
                return None; // no section in progress; ignore continuation
            }
            self.buf.extend_from_slice(payload);
        }

        if self.buf.len() < 3 {
            return None;
        }
        if self.want.is_none() {
            let sec_len = ((self.buf[1] & 0x0F) as usize) << 8 | self.buf[2] as usize;
            if sec_len < 5 || 3 + sec_len > PSI_MAX_SIZE {
                self.buf.clear();
                return None;
            }
            self.want = Some(3 + sec_len);
        }

        let want = self.want.unwrap();
        if self.buf.len() < want {
            return None;
        }

        let section = self.buf[..want].to_vec();
        self.buf.clear();
        self.want = None;
        Some(section)
    }
}

/// Chunks a reassembled section (table_id..CRC inclusive) back into
/// 188-byte TS packets with a correct pointer field and continuity
/// counters, invoking `sink` for each packet produced.
pub fn psi_emit(pid: u16, section: &[u8], continuity: &mut u8, mut sink: impl FnMut([u8; TS_PACKET_SIZE])) {
    let mut remaining = section;
    let mut first = true;

    while first || !remaining.is_empty() {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = (if first { 0x40 } else { 0x00 }) | (((pid >> 8) as u8) & 0x1F);
        pkt[2] = (pid & 0xFF) as u8;
        pkt[3] = 0x10 | (*continuity & 0x0F);
        *continuity = continuity.wrapping_add(1) & 0x0F;

        let header = if first { 5 } else { 4 };
        if first {
            pkt[4] = 0x00; // pointer_field: section starts immediately after it
        }
        let avail = TS_PACKET_SIZE - header;
        let take = remaining.len().min(avail);
        pkt[header..header + take].copy_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        sink(pkt);
        first = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_bytes(table_id: u8, body: &[u8]) -> Vec<u8> {
        let mut s = vec![table_id, 0, 0, 0, 0, 0, 0, 0];
        s.extend_from_slice(body);
        let sec_len = (s.len() - 3 + CRC32_SIZE) as u16;
        s[1] = ((sec_len >> 8) as u8 & 0x0F) | 0xB0;
        s[2] = (sec_len & 0xFF) as u8;
        let crc = psi_calc_crc32(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    #[test]
    fn reader_roundtrips_simple_section() {
        let bytes = section_bytes(0x00, &[1, 2, 3]);
        let sec = SectionReader::from_section_bytes(&bytes).unwrap();
        assert_eq!(sec.table_id, 0x00);
        assert_eq!(sec.body, &[1, 2, 3]);
    }

    #[test]
    fn reader_rejects_bad_crc() {
        let mut bytes = section_bytes(0x00, &[1, 2, 3]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(SectionReader::from_section_bytes(&bytes).is_err());
    }

    #[test]
    fn buffer_reassembles_single_packet_section() {
        let section = section_bytes(0x00, &[9, 9]);
        let mut payload = vec![0u8]; // pointer_field = 0
        payload.extend_from_slice(&section);
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[1] = 0x40; // payload_unit_start
        let mut buf = PsiBuffer::new();
        let out = buf.feed(&pkt, &payload).expect("complete section");
        assert_eq!(out, section);
    }

    #[test]
    fn emit_roundtrips_through_reader() {
        let section = section_bytes(0x02, &[0xAA; 200]); // forces multi-packet emit
        let mut cc = 0u8;
        let mut packets = Vec::new();
        psi_emit(0x30, &section, &mut cc, |p| packets.push(p));
        assert!(packets.len() > 1);

        let mut buf = PsiBuffer::new();
        let mut reassembled = None;
        for pkt in &packets {
            let payload = &pkt[4..];
            if let Some(s) = buf.feed(pkt, payload) {
                reassembled = Some(s);
            }
        }
        assert_eq!(reassembled.unwrap(), section);
    }
}
