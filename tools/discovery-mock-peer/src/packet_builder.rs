//! Pure functions for building and reading discovery packets.

use std::net::SocketAddr;

use crate::constants::QUERY_LEN;

/// A query as received by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub tag: [u8; 3],
    pub reply_port: i32,
    pub src: SocketAddr,
}

impl Query {
    /// Where the answer goes: the sender's host at the embedded port.
    pub fn reply_addr(&self) -> Option<SocketAddr> {
        let port = u16::try_from(self.reply_port).ok().filter(|p| *p != 0)?;
        Some(SocketAddr::new(self.src.ip(), port))
    }
}

/// Build a query packet.
pub fn build_query(tag: [u8; 3], reply_port: i32) -> [u8; QUERY_LEN] {
    let mut packet = [0u8; QUERY_LEN];
    packet[..3].copy_from_slice(&tag);
    packet[3..].copy_from_slice(&reply_port.to_le_bytes());
    packet
}

/// Read a query packet; `None` for anything that is not exactly one query.
pub fn parse_query(raw: &[u8], src: SocketAddr) -> Option<Query> {
    if raw.len() != QUERY_LEN {
        return None;
    }
    let mut tag = [0u8; 3];
    tag.copy_from_slice(&raw[..3]);
    let reply_port = i32::from_le_bytes([raw[3], raw[4], raw[5], raw[6]]);
    Some(Query {
        tag,
        reply_port,
        src,
    })
}

/// Build an acknowledgement line.
pub fn build_ack(
    token: &str,
    id: &str,
    data_streamer: (&str, u16),
    control_api: (&str, u16),
    license_id: &str,
) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        token, id, data_streamer.0, data_streamer.1, control_api.0, control_api.1, license_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ACK_TS, TAG_DS};

    #[test]
    fn test_query_layout() {
        let packet = build_query(TAG_DS, 18502);
        assert_eq!(&packet[..3], b"?DS");
        assert_eq!(&packet[3..], &18502i32.to_le_bytes());
    }

    #[test]
    fn test_parse_query() {
        let src: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let query = parse_query(&build_query(TAG_DS, 5000), src).unwrap();
        assert_eq!(query.tag, TAG_DS);
        assert_eq!(query.reply_addr(), Some("127.0.0.1:5000".parse().unwrap()));

        assert!(parse_query(b"?DS", src).is_none());
        let bad_port = parse_query(&build_query(TAG_DS, -1), src).unwrap();
        assert!(bad_port.reply_addr().is_none());
    }

    #[test]
    fn test_build_ack() {
        assert_eq!(
            build_ack(ACK_TS, "ts1", ("10.0.0.5", 9000), ("10.0.0.5", 9001), "N/A"),
            "ACK ts1 10.0.0.5 9000 10.0.0.5 9001 N/A"
        );
    }
}
