use serde::{
    de::{Error as _, IgnoredAny, Unexpected},
    Deserialize, Deserializer, Serialize,
};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Signaling message relayed between peers.
///
/// `kind` (`offer`, `answer`, `candidate`, `join`, `leave`, `error`, ...) and
/// `payload` only mean something to clients. The payload is kept as raw JSON so
/// the relay never depends on the shape of the negotiation protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    /// Always assigned by the relay; whatever the client sends is discarded.
    #[serde(default, deserialize_with = "discard_client_sender")]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frames are not supported ({len} bytes)")]
    Binary { len: usize },
}

impl Envelope {
    /// Decodes one envelope. Only a JSON object is accepted; serde would
    /// otherwise read a top-level array as positional fields.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        if text.trim_start_matches([' ', '\t', '\n', '\r']).starts_with('[') {
            let err = serde_json::Error::invalid_type(Unexpected::Seq, &"an envelope object");
            return Err(err.into());
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Overwrites the sender with the identity of the connection it arrived on.
    pub fn stamp(&mut self, sender: ConnectionId) {
        self.sender = sender.to_string();
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|raw| raw.get().len()).unwrap_or(0)
    }
}

fn discard_client_sender<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IgnoredAny::deserialize(deserializer)?;
    Ok(String::new())
}
