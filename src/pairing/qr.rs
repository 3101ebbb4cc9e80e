//! QR pairing payload (§6.1), rendered as a scannable code.
//!
//! Grounded on the original's `qr_generator` contract, rendered with the
//! `qrcode` crate already listed in the teacher's `Cargo.toml` (unused by
//! any of its own subcommands) rather than a new dependency.

use qrcode::render::unicode;
use qrcode::QrCode;
use serde::{Deserialize, Serialize};

use super::error::CryptoError;

pub const QR_PAYLOAD_VERSION: u32 = 1;

/// The only cross-implementation contract on the QR channel: a version tag
/// and the 32-byte master secret. Everything else (IP, port, topic, session
/// id) is derived from the secret and must never be transmitted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrPayload {
    pub version: u32,
    #[serde(with = "hex_bytes")]
    pub master_secret: [u8; 32],
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("master_secret must be 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl QrPayload {
    pub fn new(master_secret: [u8; 32]) -> Self {
        Self {
            version: QR_PAYLOAD_VERSION,
            master_secret,
        }
    }

    /// `u32` big-endian length prefix followed by the canonical JSON record.
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let body = serde_json::to_vec(self).map_err(|_| CryptoError::BadKeyLength)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 4 {
            return Err(CryptoError::BadKeyLength);
        }
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let body = bytes.get(4..4 + len).ok_or(CryptoError::BadKeyLength)?;
        serde_json::from_slice(body).map_err(|_| CryptoError::BadKeyLength)
    }

    /// Renders the payload as a terminal-printable QR code.
    pub fn render_terminal(&self) -> Result<String, CryptoError> {
        let bytes = self.encode()?;
        let code = QrCode::new(bytes).map_err(|_| CryptoError::BadKeyLength)?;
        Ok(code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::crypto;

    #[test]
    fn round_trips_through_length_prefixed_encoding() {
        let payload = QrPayload::new(crypto::generate_secret());
        let encoded = payload.encode().unwrap();
        let decoded = QrPayload::decode(&encoded).unwrap();
        assert_eq!(payload, decoded);
        assert_eq!(decoded.version, QR_PAYLOAD_VERSION);
    }

    #[test]
    fn renders_nonempty_terminal_qr() {
        let payload = QrPayload::new(crypto::generate_secret());
        let rendered = payload.render_terminal().unwrap();
        assert!(!rendered.is_empty());
    }
}
