//! Protocol dialect encoders.
//!
//! An encoder owns the frame-level representation of one protocol dialect:
//! it decodes inbound client frames into [`Message`]s and encodes outbound
//! [`Reply`]s and verbatim transmissions. Sessions hold exactly one encoder;
//! the base JSON dialect ships here, other dialects plug in through the
//! trait.

use gw_protocol::{Command, Message, Reply};

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("undecodable frame: {0}")]
    Undecodable(String),
    #[error("unencodable reply: {0}")]
    Unencodable(String),
}

pub trait Encoder: Send + Sync {
    /// Stable dialect name; used as the memoization key when a broadcast is
    /// encoded once and fanned out to many sessions.
    fn name(&self) -> &'static str;

    fn decode(&self, frame: &[u8]) -> Result<Message, EncoderError>;

    fn encode(&self, reply: &Reply) -> Result<Vec<u8>, EncoderError>;

    /// Encode a transmission produced by the command server. Transmissions
    /// are already dialect-shaped payload strings and pass through verbatim
    /// in the base dialect.
    fn encode_transmission(&self, raw: &str) -> Result<Vec<u8>, EncoderError>;

    /// Whether sessions of this dialect authenticate during the connection
    /// handshake. Dialects that defer authentication to a protocol frame
    /// (e.g. an init message) return false and run their connect command
    /// later.
    fn authenticate_on_connect(&self) -> bool {
        true
    }

    /// Commands an unauthenticated session is allowed to execute.
    fn unauthenticated_commands(&self) -> &[Command] {
        &[]
    }
}

/// The base dialect: JSON text frames both ways.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, EncoderError> {
        serde_json::from_slice(frame).map_err(|e| EncoderError::Undecodable(e.to_string()))
    }

    fn encode(&self, reply: &Reply) -> Result<Vec<u8>, EncoderError> {
        serde_json::to_vec(reply).map_err(|e| EncoderError::Unencodable(e.to_string()))
    }

    fn encode_transmission(&self, raw: &str) -> Result<Vec<u8>, EncoderError> {
        Ok(raw.as_bytes().to_vec())
    }
}
