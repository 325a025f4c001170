//! Composite chat payload carried inside a payment's custom record.
//!
//! The payload is a JSON object:
//!
//! ```text
//! { "participants": ["<addr>", ...], "message": "<utf8>" }
//! ```
//!
//! Participants are written in the order the sender stores them; the
//! receiver re-normalises the set when resolving a discussion.

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::types::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub participants: Vec<Address>,
    #[serde(default)]
    pub message: String,
}

impl Payload {
    pub fn new(participants: &[Address], message: &str) -> Self {
        Self {
            participants: participants.to_vec(),
            message: message.to_string(),
        }
    }

    /// Serialize to the on-wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse on-wire bytes. Empty input is the empty payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PayloadError> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        std::str::from_utf8(data).map_err(|_| PayloadError::InvalidUtf8)?;
        Ok(serde_json::from_slice(data)?)
    }
}

/// Encode `text` for a discussion with the given participants.
pub fn encode(participants: &[Address], text: &str) -> Result<Vec<u8>, PayloadError> {
    Payload::new(participants, text).to_bytes()
}

/// Decode raw payload bytes into `(text, participants)`.
pub fn decode(data: &[u8]) -> Result<(String, Vec<Address>), PayloadError> {
    let payload = Payload::from_bytes(data)?;
    Ok((payload.message, payload.participants))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn addr(c: char) -> Address {
        Address::parse(&format!("02{}", c.to_string().repeat(64))).unwrap()
    }

    #[test]
    fn test_wire_format_is_stable() {
        let bytes = encode(&[addr('b'), addr('a')], "hi").unwrap();
        let expected = format!(
            r#"{{"participants":["{}","{}"],"message":"hi"}}"#,
            addr('b'),
            addr('a')
        );
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn test_decode_restores_text_and_participant_set() {
        let participants = vec![addr('c'), addr('a'), addr('b')];
        let bytes = encode(&participants, "gm ☀").unwrap();
        let (text, decoded) = decode(&bytes).unwrap();
        assert_eq!(text, "gm ☀");
        let a: BTreeSet<_> = participants.into_iter().collect();
        let b: BTreeSet<_> = decoded.into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input_is_empty_payload() {
        let (text, participants) = decode(&[]).unwrap();
        assert_eq!(text, "");
        assert!(participants.is_empty());
    }

    #[test]
    fn test_malformed_input_fails() {
        assert!(matches!(decode(b"{not json"), Err(PayloadError::Malformed(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(PayloadError::InvalidUtf8)));
        let bad_addr = br#"{"participants":["xyz"],"message":"m"}"#;
        assert!(decode(bad_addr).is_err());
    }

    #[test]
    fn test_missing_fields_default() {
        let (text, participants) = decode(br#"{"message":"solo"}"#).unwrap();
        assert_eq!(text, "solo");
        assert!(participants.is_empty());
    }
}
