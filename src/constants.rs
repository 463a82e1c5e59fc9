//! Constants for MPEG-TS processing and CA/CSA handling

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const NULL_PID: u16 = 0x1FFF;

/// PSI section constants
pub const PSI_MAX_SIZE: usize = 4096;
pub const CRC32_SIZE: usize = 4;

/// Entitlement message constants
pub const EM_MAX_SIZE: usize = 1024;

/// CA descriptor tag (DVB SI descriptor space)
pub const DESC_CA_TAG: u8 = 0x09;

/// CAID assigned to a synthetic BISS stream
pub const BISS_CAID: u16 = 0x2600;
