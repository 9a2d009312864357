//! Discovery wire packets.
//!
//! A query is a 3-byte role tag followed by the sender's reply-listener port
//! as a little-endian `i32`. Replies are single UTF-8 text lines:
//!
//! ```text
//! ACK   <id> <dataEndpoint> <dataPort> <controlEndpoint> <controlPort> <licenseId>
//! ACKDS <id> <dataEndpoint> <dataPort> <controlEndpoint> <controlPort> <licenseId>
//! NAK
//! ```

use std::fmt;
use std::str;

use crate::types::{DeviceInfo, LocalIdentity};

/// Length of a query role tag.
pub const QUERY_TAG_LEN: usize = 3;

/// Length of a complete query packet.
pub const QUERY_PACKET_LEN: usize = QUERY_TAG_LEN + 4;

/// Tag of a query sent by a Data Source looking for a Tracking Service.
pub const TAG_LOOKING_FOR_TRACKING_SERVICE: [u8; QUERY_TAG_LEN] = *b"?TS";

/// Tag of a query sent by a Tracking Service looking for Data Sources.
pub const TAG_LOOKING_FOR_DATA_SOURCE: [u8; QUERY_TAG_LEN] = *b"?DS";

/// Reply token of a Tracking Service.
pub const ACK_TRACKING_SERVICE: &str = "ACK";

/// Reply token of a Data Source.
pub const ACK_DATA_SOURCE: &str = "ACKDS";

/// Negative acknowledgment token.
pub const NAK: &str = "NAK";

/// Errors produced while parsing discovery packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("unknown query tag {0:02X?}")]
    UnknownTag([u8; QUERY_TAG_LEN]),
    #[error("reply is not valid UTF-8")]
    NotUtf8,
    #[error("unknown reply token {0:?}")]
    UnknownReply(String),
    #[error("reply is missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// Role tag carried by a query packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTag {
    LookingForTrackingService,
    LookingForDataSource,
}

impl QueryTag {
    /// Wire bytes of this tag.
    pub fn bytes(self) -> [u8; QUERY_TAG_LEN] {
        match self {
            QueryTag::LookingForTrackingService => TAG_LOOKING_FOR_TRACKING_SERVICE,
            QueryTag::LookingForDataSource => TAG_LOOKING_FOR_DATA_SOURCE,
        }
    }

    /// Matches wire bytes against the known tags.
    pub fn from_bytes(bytes: [u8; QUERY_TAG_LEN]) -> Option<Self> {
        match bytes {
            TAG_LOOKING_FOR_TRACKING_SERVICE => Some(QueryTag::LookingForTrackingService),
            TAG_LOOKING_FOR_DATA_SOURCE => Some(QueryTag::LookingForDataSource),
            _ => None,
        }
    }
}

impl fmt::Display for QueryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryTag::LookingForTrackingService => write!(f, "looking-for-tracking-service"),
            QueryTag::LookingForDataSource => write!(f, "looking-for-data-source"),
        }
    }
}

/// A query packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPacket {
    pub tag: QueryTag,
    /// Port the sender listens on for replies, as carried on the wire.
    pub reply_port: i32,
}

impl QueryPacket {
    pub fn new(tag: QueryTag, reply_port: u16) -> Self {
        Self {
            tag,
            reply_port: i32::from(reply_port),
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> [u8; QUERY_PACKET_LEN] {
        let mut out = [0u8; QUERY_PACKET_LEN];
        out[..QUERY_TAG_LEN].copy_from_slice(&self.tag.bytes());
        out[QUERY_TAG_LEN..].copy_from_slice(&self.reply_port.to_le_bytes());
        out
    }

    /// Parse wire bytes. Trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < QUERY_PACKET_LEN {
            return Err(PacketError::TooShort {
                expected: QUERY_PACKET_LEN,
                actual: data.len(),
            });
        }

        let mut tag = [0u8; QUERY_TAG_LEN];
        tag.copy_from_slice(&data[..QUERY_TAG_LEN]);
        let tag = QueryTag::from_bytes(tag).ok_or(PacketError::UnknownTag(tag))?;

        let mut port = [0u8; 4];
        port.copy_from_slice(&data[QUERY_TAG_LEN..QUERY_PACKET_LEN]);

        Ok(Self {
            tag,
            reply_port: i32::from_le_bytes(port),
        })
    }

    /// The reply port when it is a usable UDP port.
    pub fn valid_reply_port(&self) -> Option<u16> {
        u16::try_from(self.reply_port).ok().filter(|p| *p != 0)
    }
}

/// Which role sent a positive reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// `ACK`, sent by a Tracking Service.
    TrackingService,
    /// `ACKDS`, sent by a Data Source.
    DataSource,
}

impl AckKind {
    pub fn token(self) -> &'static str {
        match self {
            AckKind::TrackingService => ACK_TRACKING_SERVICE,
            AckKind::DataSource => ACK_DATA_SOURCE,
        }
    }
}

/// A parsed reply packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPacket {
    Ack { kind: AckKind, device: DeviceInfo },
    Nak,
}

impl ReplyPacket {
    /// Parse a reply line.
    ///
    /// The first token is matched exactly, so `ACKDS` never parses as `ACK`.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let text = str::from_utf8(data).map_err(|_| PacketError::NotUtf8)?;
        let text = text.trim_end_matches(['\r', '\n', '\0']);

        let mut fields = text.splitn(7, ' ');
        let token = fields.next().unwrap_or_default();
        let kind = match token {
            ACK_TRACKING_SERVICE => AckKind::TrackingService,
            ACK_DATA_SOURCE => AckKind::DataSource,
            NAK => return Ok(ReplyPacket::Nak),
            other => return Err(PacketError::UnknownReply(other.to_string())),
        };

        let mut next = |name: &'static str| {
            fields
                .next()
                .filter(|f| !f.is_empty())
                .ok_or(PacketError::MissingField(name))
        };

        let id = next("id")?;
        let data_endpoint = next("data_endpoint")?;
        let data_port = parse_port(next("data_port")?)?;
        let control_endpoint = next("control_endpoint")?;
        let control_port = parse_port(next("control_port")?)?;
        let license_id = next("license_id")?;

        Ok(ReplyPacket::Ack {
            kind,
            device: DeviceInfo::new(
                id,
                license_id,
                (data_endpoint, data_port),
                (control_endpoint, control_port),
            ),
        })
    }
}

fn parse_port(field: &str) -> Result<u16, PacketError> {
    field
        .parse::<u16>()
        .map_err(|_| PacketError::InvalidPort(field.to_string()))
}

/// Compose the reply line a listener sends for `identity`.
///
/// The identity's endpoints must already be resolved to concrete hosts.
pub fn compose_ack(kind: AckKind, identity: &LocalIdentity) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        kind.token(),
        identity.id,
        identity.data_streamer_endpoint,
        identity.data_streamer_port,
        identity.control_api_endpoint,
        identity.control_api_port,
        identity.license_id
    )
}
