//! PMT parsing and the CA-stripping rewrite described in [`crate::engine`].

use crate::psi::cat::{CaDescriptor, DescriptorIter};
use crate::psi::section::{psi_calc_crc32, SectionReader};

/// ─────────── PMT ───────────
#[derive(Clone)]
pub struct PmtInfo {
    pub version: u8,
    pub program_number: u16,
    pub pcr_pid: u16,
    pub streams: Vec<StreamInfo>,
}

#[derive(Clone, Copy)]
pub struct StreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
}

/// Read-only parse used when the caller just needs the program's shape
/// (no rewrite in progress).
pub fn parse_pmt(section: &[u8]) -> anyhow::Result<PmtInfo> {
    let sec = SectionReader::from_section_bytes(section)?;
    if sec.table_id != 0x02 {
        anyhow::bail!("not PMT");
    }
    let b = sec.body;
    if b.len() < 4 {
        anyhow::bail!("truncated PMT body");
    }

    let pcr_pid = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    let mut idx = 4 + prog_info_len;

    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let pid = (((b[idx + 1] & 0x1F) as u16) << 8) | (b[idx + 2] as u16);
        let eslen = (((b[idx + 3] & 0x0F) as usize) << 8) | (b[idx + 4] as usize);
        streams.push(StreamInfo {
            stream_type: stype,
            elementary_pid: pid,
        });
        idx += 5 + eslen;
    }

    Ok(PmtInfo {
        version: sec.version,
        program_number: sec.program_number,
        pcr_pid,
        streams,
    })
}

/// Just the table_id/program_number pair, cheap to check before committing
/// to a full rewrite pass.
pub fn pmt_header(section: &[u8]) -> anyhow::Result<(u8, u16)> {
    let sec = SectionReader::from_section_bytes(section)?;
    Ok((sec.table_id, sec.program_number))
}

/// Rebuilds a PMT section with every CA_descriptor (tag 0x09) removed from
/// both the program-info loop and each ES's descriptor loop, preserving
/// every other byte (including non-CA descriptors, verbatim).
///
/// `on_ca_descriptor(desc, already_selected_in_this_loop, es_pid)` is
/// invoked once per CA_descriptor encountered and decides whether the
/// engine now considers an ECM/EMM PID "selected" for that descriptor
/// loop; `es_pid` is `None` for the program-info loop and `Some` for an
/// ES's own descriptor loop. The returned flag only affects bookkeeping
/// (duplicate-selection logging), never which bytes are kept — all CA
/// descriptors are stripped.
pub fn rewrite_pmt(
    _pid: u16,
    section: &[u8],
    mut on_ca_descriptor: impl FnMut(CaDescriptor, bool, Option<u16>) -> bool,
) -> anyhow::Result<(PmtInfo, Vec<u8>)> {
    let sec = SectionReader::from_section_bytes(section)?;
    if sec.table_id != 0x02 {
        anyhow::bail!("not PMT");
    }
    let b = sec.body;
    if b.len() < 4 {
        anyhow::bail!("truncated PMT body");
    }

    let pcr_pid = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    if 4 + prog_info_len > b.len() {
        anyhow::bail!("program_info_length overruns body");
    }

    let mut out = Vec::with_capacity(section.len());
    out.extend_from_slice(&section[0..10]); // table_id .. PCR_PID, verbatim

    let prog_desc_start = out.len();
    let mut is_ecm_selected = false;
    for (tag, data) in DescriptorIter::new(&b[4..4 + prog_info_len]) {
        if tag == crate::constants::DESC_CA_TAG {
            if let Some(ca) = ca_descriptor_from_data(data) {
                if on_ca_descriptor(ca, is_ecm_selected, None) {
                    is_ecm_selected = true;
                }
            }
        } else {
            out.push(tag);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }
    }
    let prog_desc_size = (out.len() - prog_desc_start) as u16;
    out.push(0); // reserved+program_info_length placeholder (hi)
    out.push(0); // program_info_length placeholder (lo)
    // patch the two bytes we just reserved, preserving the original's
    // reserved bits (top nibble of the hi byte)
    let reserved_bits = section[10] & 0xF0;
    let hi_idx = out.len() - 2;
    out[hi_idx] = reserved_bits | ((prog_desc_size >> 8) as u8 & 0x0F);
    out[hi_idx + 1] = (prog_desc_size & 0xFF) as u8;

    let mut idx = 4 + prog_info_len;
    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let es_pid = (((b[idx + 1] & 0x1F) as u16) << 8) | (b[idx + 2] as u16);
        let eslen = (((b[idx + 3] & 0x0F) as usize) << 8) | (b[idx + 4] as usize);
        if idx + 5 + eslen > b.len() {
            anyhow::bail!("ES_info_length overruns body");
        }
        streams.push(StreamInfo {
            stream_type: stype,
            elementary_pid: es_pid,
        });

        out.extend_from_slice(&b[idx..idx + 3]); // stream_type + elementary_PID
        let es_reserved_bits = b[idx + 3] & 0xF0;
        let es_desc_start = out.len() + 2;

        let mut es_is_ecm_selected = false;
        let mut es_desc_bytes = Vec::new();
        for (tag, data) in DescriptorIter::new(&b[idx + 5..idx + 5 + eslen]) {
            if tag == crate::constants::DESC_CA_TAG {
                if let Some(ca) = ca_descriptor_from_data(data) {
                    if on_ca_descriptor(ca, es_is_ecm_selected, Some(es_pid)) {
                        es_is_ecm_selected = true;
                    }
                }
            } else {
                es_desc_bytes.push(tag);
                es_desc_bytes.push(data.len() as u8);
                es_desc_bytes.extend_from_slice(data);
            }
        }
        let es_desc_size = es_desc_bytes.len() as u16;
        out.push(es_reserved_bits | ((es_desc_size >> 8) as u8 & 0x0F));
        out.push((es_desc_size & 0xFF) as u8);
        debug_assert_eq!(out.len(), es_desc_start);
        out.extend_from_slice(&es_desc_bytes);

        idx += 5 + eslen;
    }

    let crc = psi_calc_crc32(&out);
    out.extend_from_slice(&crc.to_be_bytes());

    // fix up section_length (bytes 1-2) for the new total size
    let sec_len = (out.len() - 3) as u16;
    out[1] = (out[1] & 0xF0) | ((sec_len >> 8) as u8 & 0x0F);
    out[2] = (sec_len & 0xFF) as u8;

    Ok((
        PmtInfo {
            version: sec.version,
            program_number: sec.program_number,
            pcr_pid,
            streams,
        },
        out,
    ))
}

/// Decodes a single CA_descriptor's already-split data bytes (past tag and
/// length) into caid/ca_pid/private_data.
fn ca_descriptor_from_data(data: &[u8]) -> Option<CaDescriptor<'_>> {
    if data.len() < 4 {
        return None;
    }
    Some(CaDescriptor {
        caid: u16::from_be_bytes([data[0], data[1]]),
        ca_pid: (((data[2] & 0x1F) as u16) << 8) | data[3] as u16,
        private_data: &data[4..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CRC32_SIZE;

    fn pmt_section(
        pcr_pid: u16,
        prog_descs: &[(u8, &[u8])],
        streams: &[(u8, u16, &[(u8, &[u8])])],
    ) -> Vec<u8> {
        let mut prog_info = Vec::new();
        for (tag, data) in prog_descs {
            prog_info.push(*tag);
            prog_info.push(data.len() as u8);
            prog_info.extend_from_slice(data);
        }

        let mut body = Vec::new();
        body.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
        body.push((pcr_pid & 0xFF) as u8);
        body.push(0xF0 | ((prog_info.len() >> 8) as u8 & 0x0F));
        body.push((prog_info.len() & 0xFF) as u8);
        body.extend_from_slice(&prog_info);

        for (stype, pid, descs) in streams {
            let mut desc_bytes = Vec::new();
            for (tag, data) in *descs {
                desc_bytes.push(*tag);
                desc_bytes.push(data.len() as u8);
                desc_bytes.extend_from_slice(data);
            }
            body.push(*stype);
            body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
            body.push((pid & 0xFF) as u8);
            body.push(0xF0 | ((desc_bytes.len() >> 8) as u8 & 0x0F));
            body.push((desc_bytes.len() & 0xFF) as u8);
            body.extend_from_slice(&desc_bytes);
        }

        let mut s = vec![0x02u8, 0, 0, 0, 1, 0xC1, 0, 0];
        s.extend_from_slice(&body);
        let sec_len = (s.len() - 3 + CRC32_SIZE) as u16;
        s[1] = ((sec_len >> 8) as u8 & 0x0F) | 0xB0;
        s[2] = (sec_len & 0xFF) as u8;
        let crc = psi_calc_crc32(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    #[test]
    fn parse_reads_streams() {
        let ca = [0x26u8, 0x00, 0xE0, 0x50];
        let bytes = pmt_section(0x40, &[(0x09, &ca)], &[(0x1B, 0x40, &[])]);
        let pmt = parse_pmt(&bytes).unwrap();
        assert_eq!(pmt.pcr_pid, 0x40);
        assert_eq!(pmt.streams.len(), 1);
        assert_eq!(pmt.streams[0].elementary_pid, 0x40);
    }

    #[test]
    fn rewrite_strips_ca_descriptors_and_keeps_others() {
        let ca = [0x26u8, 0x00, 0xE0, 0x50];
        let other = [0x01u8];
        let bytes = pmt_section(
            0x40,
            &[(0x09, &ca), (0x52, &other)],
            &[(0x1B, 0x40, &[(0x09, &ca)])],
        );

        let mut seen_cas = 0;
        let (_info, rewritten) = rewrite_pmt(0x30, &bytes, |_ca, _already, _es_pid| {
            seen_cas += 1;
            true
        })
        .unwrap();
        assert_eq!(seen_cas, 2);

        let reparsed = parse_pmt(&rewritten).unwrap();
        assert_eq!(reparsed.pcr_pid, 0x40);
        assert_eq!(reparsed.streams.len(), 1);

        // Verify the CRC over the rewritten bytes is self-consistent and no
        // 0x09 tag byte survives in the descriptor regions.
        assert!(SectionReader::from_section_bytes(&rewritten).is_ok());
        assert!(!rewritten.windows(2).any(|w| w == [0x09, 0x04]));
    }
}
