//! Configuration surface for one decrypt engine instance.

use std::sync::Arc;

use crate::cam::Cam;

/// Options accepted when constructing a [`crate::engine::DecryptEngine`].
pub struct DecryptConfig {
    /// Required; used only for log tagging (`[decrypt <name>]`).
    pub name: String,
    /// 16 hex characters: constructs a synthetic BISS CaStream instead of
    /// waiting on PAT/CAT/PMT/CAM.
    pub biss: Option<String>,
    /// Optional CAM handle; absent means clear pass-through only (no
    /// descrambling is ever attempted).
    pub cam: Option<Arc<dyn Cam>>,
    /// Hex string forwarded opaquely to the chosen CAS plugin.
    pub cas_data: Option<Vec<u8>>,
    /// Overrides the observed program number for CAS matching purposes.
    pub cas_pnr: Option<u16>,
}

impl DecryptConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            biss: None,
            cam: None,
            cas_data: None,
            cas_pnr: None,
        }
    }

    pub fn with_biss(mut self, biss: impl Into<String>) -> Self {
        self.biss = Some(biss.into());
        self
    }

    pub fn with_cam(mut self, cam: Arc<dyn Cam>) -> Self {
        self.cam = Some(cam);
        self
    }

    pub fn with_cas_data(mut self, data: Vec<u8>) -> Self {
        self.cas_data = Some(data);
        self
    }

    pub fn with_cas_pnr(mut self, pnr: u16) -> Self {
        self.cas_pnr = Some(pnr);
        self
    }

    /// Parses `biss` into its 8-byte control word, per §6: 16 hex
    /// characters decoded as-is except for the two checksum bytes, with
    /// the same derived key installed as both even and odd.
    pub fn biss_keys(&self) -> anyhow::Result<Option<([u8; 8], [u8; 8])>> {
        let Some(hex) = &self.biss else {
            return Ok(None);
        };
        if hex.len() != 16 {
            anyhow::bail!("biss key must be 16 hex characters, got {}", hex.len());
        }
        let bytes = decode_hex(hex)?;
        if bytes.len() != 8 {
            anyhow::bail!("biss key must decode to 8 bytes");
        }
        let raw: [u8; 8] = bytes[0..8].try_into().unwrap();
        let key = crate::csa::biss_key_from_bytes(raw);
        Ok(Some((key, key)))
    }
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow::anyhow!(e)))
        .collect()
}
