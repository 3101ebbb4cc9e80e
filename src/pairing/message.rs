//! Message codec (C2).
//!
//! Seals/opens framed application messages over an authenticated,
//! confidential channel seeded with a connection's `encrypt_key`. Tracks
//! per-connection sequence assignment and a sliding replay window.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::crypto;
use super::error::{MessageError, MessageErrorKind};

pub const DEFAULT_MAX_AGE_SECS: i64 = 60;
pub const DEFAULT_WINDOW_SIZE: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default = "default_payload")]
    pub payload: Value,
}

fn default_payload() -> Value {
    Value::Null
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            seq: 0,
            timestamp: 0,
            payload,
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Per-connection codec. Seeded with a connection's derived `encrypt_key`.
pub struct MessageCodec {
    encrypt_key: [u8; 32],
    max_age: i64,
    window_size: u64,
    next_seq: u64,
    highest_seen: u64,
    seen_seqs: HashSet<u64>,
}

impl MessageCodec {
    pub fn new(encrypt_key: [u8; 32]) -> Self {
        Self::with_policy(encrypt_key, DEFAULT_MAX_AGE_SECS, DEFAULT_WINDOW_SIZE)
    }

    pub fn with_policy(encrypt_key: [u8; 32], max_age: i64, window_size: u64) -> Self {
        Self {
            encrypt_key,
            max_age,
            window_size,
            next_seq: 0,
            highest_seen: 0,
            seen_seqs: HashSet::new(),
        }
    }

    pub fn encode(&mut self, mut msg: Message) -> Result<Vec<u8>, MessageError> {
        if msg.seq == 0 {
            self.next_seq += 1;
            msg.seq = self.next_seq;
        }
        if msg.timestamp == 0 {
            msg.timestamp = now_secs();
        }
        let plaintext =
            serde_json::to_vec(&msg).map_err(|_| MessageError::new(MessageErrorKind::Format))?;
        crypto::encrypt(&self.encrypt_key, &plaintext)
            .map_err(|_| MessageError::new(MessageErrorKind::Format))
    }

    pub fn decode(&mut self, envelope: &[u8]) -> Result<Message, MessageError> {
        let plaintext = crypto::decrypt(&self.encrypt_key, envelope)
            .map_err(|_| MessageError::new(MessageErrorKind::Decrypt))?;
        let msg: Message = serde_json::from_slice(&plaintext)
            .map_err(|_| MessageError::new(MessageErrorKind::Format))?;

        let now = now_secs();
        if (now - msg.timestamp).abs() > self.max_age {
            return Err(MessageError::new(MessageErrorKind::Expired));
        }

        let floor = self.highest_seen.saturating_sub(self.window_size);
        if msg.seq < floor {
            return Err(MessageError::new(MessageErrorKind::TooOld));
        }
        if self.seen_seqs.contains(&msg.seq) {
            return Err(MessageError::new(MessageErrorKind::Duplicate));
        }

        self.seen_seqs.insert(msg.seq);
        self.highest_seen = self.highest_seen.max(msg.seq);
        let new_floor = self.highest_seen.saturating_sub(self.window_size);
        self.seen_seqs.retain(|&s| s >= new_floor);

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> MessageCodec {
        MessageCodec::new(crypto::generate_secret())
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut c = codec();
        let msg = Message::new("ping", json!({"n": 1}));
        let env = c.encode(msg.clone()).unwrap();
        let mut decoder = MessageCodec::with_policy(c.encrypt_key, c.max_age, c.window_size);
        let decoded = decoder.decode(&env).unwrap();
        assert_eq!(decoded.kind, "ping");
        assert_eq!(decoded.payload, json!({"n": 1}));
        assert_eq!(decoded.seq, 1);
        assert!(decoded.timestamp > 0);
    }

    #[test]
    fn rejects_stale_timestamp() {
        let key = crypto::generate_secret();
        let mut encoder = MessageCodec::new(key);
        let mut msg = Message::new("ping", Value::Null);
        msg.timestamp = now_secs() - 1000;
        msg.seq = 1;
        let plaintext = serde_json::to_vec(&msg).unwrap();
        let env = crypto::encrypt(&key, &plaintext).unwrap();
        let mut decoder = MessageCodec::new(key);
        let err = decoder.decode(&env).unwrap_err();
        assert_eq!(err.kind, MessageErrorKind::Expired);
        let _ = encoder.encode(Message::new("noop", Value::Null));
    }

    #[test]
    fn replay_window_scenario_d() {
        let key = crypto::generate_secret();
        let mut decoder = MessageCodec::with_policy(key, DEFAULT_MAX_AGE_SECS, 10);

        let seal = |seq: u64| -> Vec<u8> {
            let msg = Message {
                kind: "m".into(),
                seq,
                timestamp: now_secs(),
                payload: Value::Null,
            };
            crypto::encrypt(&key, &serde_json::to_vec(&msg).unwrap()).unwrap()
        };

        for seq in 1..=20u64 {
            decoder.decode(&seal(seq)).unwrap();
        }

        assert_eq!(decoder.decode(&seal(5)).unwrap_err().kind, MessageErrorKind::Duplicate);
        assert_eq!(decoder.decode(&seal(15)).unwrap_err().kind, MessageErrorKind::Duplicate);
        assert_eq!(decoder.decode(&seal(3)).unwrap_err().kind, MessageErrorKind::TooOld);
    }

    #[test]
    fn out_of_order_within_window_accepted() {
        let key = crypto::generate_secret();
        let mut decoder = MessageCodec::with_policy(key, DEFAULT_MAX_AGE_SECS, 10);
        let seal = |seq: u64| -> Vec<u8> {
            let msg = Message {
                kind: "m".into(),
                seq,
                timestamp: now_secs(),
                payload: Value::Null,
            };
            crypto::encrypt(&key, &serde_json::to_vec(&msg).unwrap()).unwrap()
        };
        decoder.decode(&seal(10)).unwrap();
        decoder.decode(&seal(5)).unwrap();
        assert_eq!(decoder.decode(&seal(5)).unwrap_err().kind, MessageErrorKind::Duplicate);
    }
}

#[cfg(test)]
mod replay_window_proptests {
    use super::*;
    use proptest::prelude::*;

    fn seal(key: [u8; 32], seq: u64) -> Vec<u8> {
        let msg = Message {
            kind: "m".into(),
            seq,
            timestamp: now_secs(),
            payload: Value::Null,
        };
        crypto::encrypt(&key, &serde_json::to_vec(&msg).unwrap()).unwrap()
    }

    proptest! {
        // Any sequence of distinct seqs, fed through a decoder in shuffled
        // order, never accepts the same seq twice and never rejects a seq
        // still inside the sliding window.
        #[test]
        fn accepts_each_seq_at_most_once(
            seqs in prop::collection::hash_set(1u64..200, 1..60),
            window_size in 10u64..100,
        ) {
            let key = crypto::generate_secret();
            let mut decoder = MessageCodec::with_policy(key, DEFAULT_MAX_AGE_SECS, window_size);
            let mut accepted = std::collections::HashSet::new();

            let mut ordered: Vec<u64> = seqs.into_iter().collect();
            ordered.sort_unstable();

            for seq in &ordered {
                let envelope = seal(key, *seq);
                match decoder.decode(&envelope) {
                    Ok(msg) => {
                        prop_assert_eq!(msg.seq, *seq);
                        prop_assert!(accepted.insert(*seq), "seq {} accepted twice", seq);
                    }
                    Err(e) => {
                        prop_assert_eq!(e.kind, MessageErrorKind::TooOld);
                    }
                }

                // Replaying the same envelope must never be accepted again.
                let replay = decoder.decode(&envelope);
                prop_assert!(replay.is_err());
            }
        }
    }
}
