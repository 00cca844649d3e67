use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, ScriptBuf};
use crypto_utils::hash::sha256;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Protocol tag pushed ahead of every commitment in a data-carrier output.
pub const COMMITMENT_TAG: [u8; 4] = *b"MINT";

const MAX_CONTENT_TYPE_LEN: usize = 255;

/// One unit of data committed by a chain link (e.g. one inscription).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub content_type: String,
    #[serde(with = "hex_body")]
    pub body: Vec<u8>,
}

impl PayloadDescriptor {
    pub fn new(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.body.len() as u64
    }

    /// `SHA-256(content_type || 0x00 || body)`.
    pub fn commitment(&self) -> [u8; 32] {
        let mut preimage = Vec::with_capacity(self.content_type.len() + 1 + self.body.len());
        preimage.extend_from_slice(self.content_type.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(&self.body);
        sha256(&preimage)
    }

    /// Check the descriptor can be committed; `index` only labels the error.
    pub fn validate(&self, index: usize, max_body_bytes: usize) -> Result<(), EngineError> {
        let malformed = |reason: String| EngineError::MalformedPayload { index, reason };

        if self.content_type.is_empty() {
            return Err(malformed("empty content type".into()));
        }
        if self.content_type.len() > MAX_CONTENT_TYPE_LEN {
            return Err(malformed(format!(
                "content type longer than {MAX_CONTENT_TYPE_LEN} bytes"
            )));
        }
        if !self
            .content_type
            .bytes()
            .all(|b| b.is_ascii_graphic() || b == b' ')
        {
            return Err(malformed("content type is not printable ascii".into()));
        }
        if self.body.is_empty() {
            return Err(malformed("empty body".into()));
        }
        if self.body.len() > max_body_bytes {
            return Err(malformed(format!(
                "body of {} bytes exceeds {max_body_bytes}",
                self.body.len()
            )));
        }
        Ok(())
    }
}

/// SHA-256 over the concatenated per-payload commitments.
pub fn combined_commitment(payloads: &[PayloadDescriptor]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(payloads.len() * 32);
    for payload in payloads {
        preimage.extend_from_slice(&payload.commitment());
    }
    sha256(&preimage)
}

/// `OP_RETURN <tag> <commitment>`, the zero-value data-carrier script.
pub fn data_carrier_script(commitment: &[u8; 32]) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(COMMITMENT_TAG)
        .push_slice(*commitment)
        .into_script()
}

/// Recover the commitment from a script built by [`data_carrier_script`].
pub fn parse_data_carrier(script: &ScriptBuf) -> Option<[u8; 32]> {
    let expected_prefix = data_carrier_script(&[0u8; 32]);
    let bytes = script.as_bytes();
    if bytes.len() != expected_prefix.len() {
        return None;
    }
    let split = bytes.len() - 32;
    if bytes[..split] != expected_prefix.as_bytes()[..split] {
        return None;
    }
    bytes[split..].try_into().ok()
}

mod hex_body {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
