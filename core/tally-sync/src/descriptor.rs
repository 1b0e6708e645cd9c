//! Connection descriptors and their text token form.
//!
//! A descriptor is everything one device must hand to the other, out of
//! band, to open a direct channel. It travels as a QR code or pasted text, so
//! the token uses single-character JSON keys wrapped in URL-safe base64.

use crate::pairing::PairingCode;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tally_types::PeerId;
use thiserror::Error;

/// Which side of the handshake produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "o")]
    Offer,
    #[serde(rename = "a")]
    Answer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Why a token could not be turned back into a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed connection code: {0}")]
    Malformed(String),

    #[error("expected an {expected} code but got an {actual} code")]
    WrongRole { expected: Role, actual: Role },

    #[error("connection code too long ({len} > {max} characters)")]
    TooLarge { len: usize, max: usize },
}

/// One side's half of the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub role: Role,
    /// Transport-specific session description, opaque to the codec.
    pub session_description: String,
    /// Ordered reachability candidates, opaque to the codec.
    pub candidates: Vec<String>,
    pub pairing_code: PairingCode,
    pub peer_id: PeerId,
    pub peer_label: String,
}

#[derive(Deserialize)]
struct WireDescriptor {
    r: Role,
    s: String,
    #[serde(default)]
    c: Vec<String>,
    p: String,
    i: String,
    l: String,
}

/// Encodes and decodes descriptor tokens.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorCodec {
    max_token_length: usize,
}

impl Default for DescriptorCodec {
    fn default() -> Self {
        Self {
            max_token_length: 4_096,
        }
    }
}

impl DescriptorCodec {
    pub fn new(max_token_length: usize) -> Self {
        Self { max_token_length }
    }

    /// Encodes a descriptor into a compact token.
    pub fn encode(&self, descriptor: &ConnectionDescriptor) -> String {
        let wire = json!({
            "r": descriptor.role,
            "s": descriptor.session_description,
            "c": descriptor.candidates,
            "p": descriptor.pairing_code.as_str(),
            "i": descriptor.peer_id.to_string(),
            "l": descriptor.peer_label,
        });
        URL_SAFE_NO_PAD.encode(wire.to_string())
    }

    /// Decodes a token. Whitespace anywhere in the token is ignored.
    pub fn decode(&self, token: &str) -> Result<ConnectionDescriptor, DecodeError> {
        let compact: String = token.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        if compact.is_empty() {
            return Err(DecodeError::Malformed("empty code".into()));
        }
        if compact.len() > self.max_token_length {
            return Err(DecodeError::TooLarge {
                len: compact.len(),
                max: self.max_token_length,
            });
        }

        // Accept padded tokens too; some scanners append '='.
        let bytes = URL_SAFE_NO_PAD
            .decode(compact.trim_end_matches('='))
            .map_err(|e| DecodeError::Malformed(format!("base64: {e}")))?;
        let wire: WireDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::Malformed(format!("json: {e}")))?;
        let peer_id = PeerId::parse(&wire.i)
            .map_err(|e| DecodeError::Malformed(format!("peer id: {e}")))?;

        Ok(ConnectionDescriptor {
            role: wire.r,
            session_description: wire.s,
            candidates: wire.c,
            pairing_code: PairingCode::from_raw(wire.p),
            peer_id,
            peer_label: wire.l,
        })
    }

    /// Decodes a token and checks that it came from the expected side.
    pub fn decode_expecting(
        &self,
        token: &str,
        expected: Role,
    ) -> Result<ConnectionDescriptor, DecodeError> {
        let descriptor = self.decode(token)?;
        if descriptor.role != expected {
            return Err(DecodeError::WrongRole {
                expected,
                actual: descriptor.role,
            });
        }
        Ok(descriptor)
    }
}

impl ConnectionDescriptor {
    /// Encodes with the default codec.
    pub fn to_token(&self) -> String {
        DescriptorCodec::default().encode(self)
    }

    /// Decodes with the default codec.
    pub fn from_token(token: &str) -> Result<Self, DecodeError> {
        DescriptorCodec::default().decode(token)
    }
}
