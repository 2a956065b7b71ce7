//! Envelope encoding.
//!
//! Two envelope formats are in use. Peers at version 1 (and every peer before
//! the version check completes) exchange the legacy envelope without a
//! `Version` field; version 2 onward carries it. Decoding accepts both.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MessageType;

/// Version reported for envelopes that carry no `Version` field.
pub const LEGACY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed {message_type} payload: {source}")]
    Payload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported protocol version {0}")]
    InvalidVersion(u32),
}

/// A decoded message whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.message_type == kind.as_str()
    }
}

/// Envelope layout selected by the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Legacy,
    Versioned,
}

impl EnvelopeFormat {
    /// `0` means the version has not been negotiated yet.
    pub fn for_version(version: u32) -> Self {
        if version <= LEGACY_VERSION {
            EnvelopeFormat::Legacy
        } else {
            EnvelopeFormat::Versioned
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyEnvelope<'a, T> {
    message_type: &'a str,
    payload: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VersionedEnvelope<'a, T> {
    version: u32,
    message_type: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEnvelope {
    #[serde(default)]
    version: Option<u32>,
    message_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Encode a payload for the wire at the given negotiated version.
pub fn serialize<T: Serialize>(
    message_type: MessageType,
    payload: &T,
    version: u32,
) -> Result<Vec<u8>, CodecError> {
    let tag = message_type.as_str();
    let encoded = match EnvelopeFormat::for_version(version) {
        EnvelopeFormat::Legacy => serde_json::to_vec(&LegacyEnvelope {
            message_type: tag,
            payload,
        }),
        EnvelopeFormat::Versioned => serde_json::to_vec(&VersionedEnvelope {
            version,
            message_type: tag,
            payload,
        }),
    };
    encoded.map_err(|source| CodecError::Payload {
        message_type: tag.to_string(),
        source,
    })
}

/// Encode a message that has no payload.
pub fn serialize_empty(message_type: MessageType, version: u32) -> Result<Vec<u8>, CodecError> {
    serialize(message_type, &serde_json::Value::Null, version)
}

/// Decode the envelope only; the payload stays raw.
pub fn deserialize(bytes: &[u8]) -> Result<Message, CodecError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Envelope)?;
    Ok(Message {
        message_type: raw.message_type,
        version: raw.version.unwrap_or(LEGACY_VERSION),
        payload: raw.payload,
    })
}

/// Interpret a message payload as `T`.
pub fn deserialize_payload<T: DeserializeOwned>(message: &Message) -> Result<T, CodecError> {
    T::deserialize(&message.payload).map_err(|source| CodecError::Payload {
        message_type: message.message_type.clone(),
        source,
    })
}
