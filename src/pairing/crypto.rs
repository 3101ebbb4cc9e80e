//! Key and message cryptography.
//!
//! HKDF-SHA256 derives role-scoped keys from a single 32-byte master secret;
//! AES-256-GCM seals/opens envelopes; HMAC-SHA256 authenticates the
//! challenge-response handshake and the signaling HTTP requests. Every
//! function here is pure with respect to process state — no key is ever
//! logged, and `decrypt` never reveals which of its internal checks failed.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

/// 32 cryptographically random bytes. Used for master secrets, challenge
/// nonces, and pairing session ids.
pub fn generate_secret() -> [u8; 32] {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// HKDF-SHA256 with an empty salt. Distinct `info` strings are the only
/// thing that keeps `auth_key`/`encrypt_key`/`ntfy_key`/`signaling_key`
/// independent of one another for a given master secret.
pub fn derive(master: &[u8], info: &str, len: usize) -> Result<Vec<u8>, CryptoError> {
    if master.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength);
    }
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = vec![0u8; len];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::BadKeyLength)?;
    Ok(okm)
}

pub fn derive_key(master: &[u8], info: &str) -> Result<[u8; 32], CryptoError> {
    let v = derive(master, info, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&v);
    Ok(out)
}

/// `"ras-" || lower-hex(first 6 bytes of SHA-256(master))`, identical on
/// both sides without out-of-band exchange.
pub fn rendezvous_topic(master: &[u8]) -> Result<String, CryptoError> {
    if master.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength);
    }
    let digest = Sha256::digest(master);
    Ok(format!("ras-{}", hex::encode(&digest[..6])))
}

/// `lower-hex(first 12 bytes of HKDF-SHA256(master, info="session"))`.
pub fn derive_session_id(master: &[u8]) -> Result<String, CryptoError> {
    let okm = derive(master, "session", 12)?;
    Ok(hex::encode(okm))
}

/// Seal `plaintext` as `nonce(12) || ciphertext || tag(16)`. Fails only on a
/// malformed key; the nonce is fresh CSPRNG output on every call.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ct = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open an envelope produced by [`encrypt`]. Any of: too-short input, bad key
/// length, or GCM tag mismatch collapses to the single `DecryptionFailed`
/// variant — no observable distinction between failure causes.
pub fn decrypt(key: &[u8], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength);
    }
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    let (nonce_bytes, ct) = envelope.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ct, aad: &[] })
        .map_err(|_| CryptoError::DecryptionFailed)
}

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_compute(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Constant-time equality over the full 32 bytes. Never panics on mismatch.
pub fn hmac_verify(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    if expected.len() != 32 {
        return false;
    }
    let actual = hmac_compute(key, data);
    let mut diff: u8 = 0;
    for (a, b) in actual.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// `hmac_compute(auth_key, utf8(session_id) || be64(timestamp) || body)`.
/// The byte layout is protocol-defining.
pub fn signaling_hmac(auth_key: &[u8], session_id: &str, timestamp: i64, body: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(session_id.len() + 8 + body.len());
    data.extend_from_slice(session_id.as_bytes());
    data.extend_from_slice(&(timestamp as u64).to_be_bytes());
    data.extend_from_slice(body);
    hmac_compute(auth_key, &data)
}

/// Constant-time check of a signed signaling request against
/// [`signaling_hmac`]'s expected layout.
pub fn verify_signaling_hmac(
    auth_key: &[u8],
    session_id: &str,
    timestamp: i64,
    body: &[u8],
    signature: &[u8],
) -> bool {
    if signature.len() != 32 {
        return false;
    }
    let expected = signaling_hmac(auth_key, session_id, timestamp, body);
    let mut diff: u8 = 0;
    for (a, b) in expected.iter().zip(signature.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_master() -> Vec<u8> {
        hex::decode("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn known_answer_hkdf() {
        let master = hex_master();
        assert_eq!(
            hex::encode(derive(&master, "auth", 32).unwrap()),
            "bec0c3289e346d890ea330014e23e6e7cf95f82c8bd7f5f133850c89ac165a43"
        );
        assert_eq!(
            hex::encode(derive(&master, "encrypt", 32).unwrap()),
            "fdb096356d535edd24a3eee6f2126b77018c51dff15c86ccf6bc3c76f086c2a0"
        );
        assert_eq!(
            hex::encode(derive(&master, "ntfy", 32).unwrap()),
            "e3d801b5755b78c380d59c1285c1a65290db0334cc2994dfd048ebff2df8781f"
        );
        assert_eq!(rendezvous_topic(&master).unwrap(), "ras-4884fdaafea4");
    }

    #[test]
    fn known_answer_hmac() {
        let key = hex_master();
        let message = hex::decode("fedcba9876543210".repeat(4)).unwrap();
        assert_eq!(
            hex::encode(hmac_compute(&key, &message)),
            "fc620ba9fee2a44f2ea7a4cdf04348f2fa7299feb84ea028c48f80bba0bdddb0"
        );
    }

    #[test]
    fn round_trip() {
        let key = generate_secret();
        let pt = b"hello world";
        let env = encrypt(&key, pt).unwrap();
        assert_eq!(decrypt(&key, &env).unwrap(), pt);
    }

    #[test]
    fn distinct_ciphertexts_for_same_plaintext() {
        let key = generate_secret();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let k1 = generate_secret();
        let k2 = generate_secret();
        let env = encrypt(&k1, b"hi").unwrap();
        assert_eq!(decrypt(&k2, &env).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn bit_flip_fails() {
        let key = generate_secret();
        let mut env = encrypt(&key, b"hi").unwrap();
        let last = env.len() - 1;
        env[last] ^= 0x01;
        assert!(decrypt(&key, &env).is_err());
    }

    #[test]
    fn derive_infos_are_independent() {
        let master = generate_secret();
        let a = derive_key(&master, "auth").unwrap();
        let e = derive_key(&master, "encrypt").unwrap();
        let n = derive_key(&master, "ntfy").unwrap();
        let s = derive_key(&master, "signaling").unwrap();
        assert_ne!(a, e);
        assert_ne!(a, n);
        assert_ne!(a, s);
        assert_ne!(e, n);
        assert_ne!(e, s);
        assert_ne!(n, s);
    }

    #[test]
    fn hmac_verify_rejects_tamper() {
        let key = generate_secret();
        let mac = hmac_compute(&key, b"data");
        assert!(hmac_verify(&key, b"data", &mac));
        let mut bad = mac;
        bad[0] ^= 1;
        assert!(!hmac_verify(&key, b"data", &bad));
    }
}
