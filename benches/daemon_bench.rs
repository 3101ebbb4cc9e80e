//! Criterion benchmarks for hot paths in the pairing daemon core.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - HKDF-SHA256 key derivation (per-role key bundle from a master secret)
//!   - AES-256-GCM envelope seal/open (every message on the wire)
//!   - HMAC-SHA256 compute/verify (challenge-response handshake, signaling auth)
//!   - Message codec encode/decode, including sliding replay-window bookkeeping

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pairing_daemon::pairing::crypto;
use pairing_daemon::pairing::{Message, MessageCodec};
use serde_json::json;

// ─── HKDF key derivation ─────────────────────────────────────────────────────

fn bench_hkdf(c: &mut Criterion) {
    let master = crypto::generate_secret();

    c.bench_function("hkdf_derive_key_auth", |b| {
        b.iter(|| {
            let key = crypto::derive_key(black_box(&master), black_box("auth")).unwrap();
            black_box(key);
        });
    });

    c.bench_function("hkdf_rendezvous_topic", |b| {
        b.iter(|| {
            let topic = crypto::rendezvous_topic(black_box(&master)).unwrap();
            black_box(topic);
        });
    });
}

// ─── AES-256-GCM envelope ────────────────────────────────────────────────────

fn bench_envelope(c: &mut Criterion) {
    let key = crypto::generate_secret();
    let plaintext = br#"{"type":"terminal.output","seq":1,"timestamp":1700000000,"payload":{"data":"ls -la\n"}}"#;

    c.bench_function("envelope_encrypt", |b| {
        b.iter(|| {
            let env = crypto::encrypt(black_box(&key), black_box(plaintext)).unwrap();
            black_box(env);
        });
    });

    let envelope = crypto::encrypt(&key, plaintext).unwrap();
    c.bench_function("envelope_decrypt", |b| {
        b.iter(|| {
            let pt = crypto::decrypt(black_box(&key), black_box(&envelope)).unwrap();
            black_box(pt);
        });
    });
}

// ─── HMAC ────────────────────────────────────────────────────────────────────

fn bench_hmac(c: &mut Criterion) {
    let key = crypto::generate_secret();
    let data = crypto::generate_secret();

    c.bench_function("hmac_compute", |b| {
        b.iter(|| {
            let mac = crypto::hmac_compute(black_box(&key), black_box(&data));
            black_box(mac);
        });
    });

    let mac = crypto::hmac_compute(&key, &data);
    c.bench_function("hmac_verify", |b| {
        b.iter(|| {
            let ok = crypto::hmac_verify(black_box(&key), black_box(&data), black_box(&mac));
            black_box(ok);
        });
    });

    c.bench_function("signaling_hmac", |b| {
        b.iter(|| {
            let mac = crypto::signaling_hmac(
                black_box(&key),
                black_box("01HXYZ1234567890ABCDEFGHIJ"),
                black_box(1_700_000_000i64),
                black_box(b"{}"),
            );
            black_box(mac);
        });
    });
}

// ─── Message codec ───────────────────────────────────────────────────────────

fn bench_codec(c: &mut Criterion) {
    c.bench_function("codec_encode", |b| {
        let mut codec = MessageCodec::new(crypto::generate_secret());
        b.iter(|| {
            let msg = Message::new("terminal.output", json!({"data": "ls -la\n"}));
            let env = codec.encode(black_box(msg)).unwrap();
            black_box(env);
        });
    });

    // Decode throughput once the replay window is warm: 1000 envelopes
    // already seen, every further decode pays the full
    // highest_seen/seen_seqs bookkeeping cost.
    c.bench_function("codec_decode_sliding_window", |b| {
        let key = crypto::generate_secret();
        let mut encoder = MessageCodec::new(key);
        let envelopes: Vec<Vec<u8>> = (0..1000)
            .map(|_| encoder.encode(Message::new("heartbeat", json!({}))).unwrap())
            .collect();
        b.iter_with_setup(
            || MessageCodec::new(key),
            |mut decoder| {
                for env in &envelopes {
                    let _ = decoder.decode(black_box(env));
                }
            },
        );
    });
}

criterion_group!(benches, bench_hkdf, bench_envelope, bench_hmac, bench_codec);
criterion_main!(benches);
