//! Discovery wire constants.

/// Query tag sent by a Data Source looking for a Tracking Service.
pub const TAG_TS: [u8; 3] = *b"?TS";
/// Query tag sent by a Tracking Service looking for Data Sources.
pub const TAG_DS: [u8; 3] = *b"?DS";

/// Query length: 3-byte tag plus a little-endian `i32` reply port.
pub const QUERY_LEN: usize = 7;

pub const ACK_TS: &str = "ACK";
pub const ACK_DS: &str = "ACKDS";
pub const NAK: &str = "NAK";
