use crate::psi::section::SectionReader;

/// ─────────── PAT ───────────
#[derive(Clone)]
pub struct PatSection {
    pub version: u8,
    pub current_next: bool,
    pub programs: Vec<PatEntry>,
}

#[derive(Clone)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

pub fn parse_pat(section: &[u8]) -> anyhow::Result<PatSection> {
    let sec = SectionReader::from_section_bytes(section)?;
    if sec.table_id != 0x00 {
        anyhow::bail!("not PAT");
    }

    let mut idx = 0;
    let mut programs = Vec::new();
    while idx + 4 <= sec.body.len() {
        let pn = u16::from_be_bytes(sec.body[idx..idx + 2].try_into()?);
        let pid = (((sec.body[idx + 2] & 0x1F) as u16) << 8) | (sec.body[idx + 3] as u16);
        idx += 4;
        programs.push(PatEntry {
            program_number: pn,
            pmt_pid: pid,
        });
    }
    Ok(PatSection {
        version: sec.version,
        current_next: sec.current_next,
        programs,
    })
}

/// First entry whose `program_number != 0` (skips the NIT-PID entry).
pub fn first_program(pat: &PatSection) -> Option<&PatEntry> {
    pat.programs.iter().find(|e| e.program_number != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CRC32_SIZE;
    use crate::psi::section::psi_calc_crc32;

    fn pat_section(programs: &[(u16, u16)]) -> Vec<u8> {
        let mut s = vec![0x00u8, 0, 0, 0, 1, 0xC1, 0, 0];
        for (pn, pid) in programs {
            s.push((pn >> 8) as u8);
            s.push((pn & 0xFF) as u8);
            s.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
            s.push((pid & 0xFF) as u8);
        }
        let sec_len = (s.len() - 3 + CRC32_SIZE) as u16;
        s[1] = ((sec_len >> 8) as u8 & 0x0F) | 0xB0;
        s[2] = (sec_len & 0xFF) as u8;
        let crc = psi_calc_crc32(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    #[test]
    fn parses_programs_and_skips_nit_entry_in_lookup() {
        let bytes = pat_section(&[(0, 0x10), (1, 0x30), (2, 0x40)]);
        let pat = parse_pat(&bytes).unwrap();
        assert_eq!(pat.programs.len(), 3);
        let first = first_program(&pat).unwrap();
        assert_eq!(first.program_number, 1);
        assert_eq!(first.pmt_pid, 0x30);
    }
}
