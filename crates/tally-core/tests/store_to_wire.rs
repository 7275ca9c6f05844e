//! Store snapshots travelling through the full codec into a second store.

use std::thread;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tally_core::crypto::{decrypt, encrypt};
use tally_core::{
    CoreError, Decoder, EncodedPayload, Encoder, Metric, MetricStore, MetricUpdate, Signer,
};

fn replay(payload_metrics: Vec<Metric>, into: &MetricStore) {
    let updates: Vec<MetricUpdate> = payload_metrics
        .iter()
        .map(|m| m.to_update().unwrap())
        .collect();
    into.apply_batch(&updates).unwrap();
}

#[test]
fn concurrent_agent_store_arrives_intact() {
    let agent = MetricStore::new();
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let store = agent.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    store.add_counter("PollCount", 1).unwrap();
                }
                store.set_gauge(&format!("Worker{i}"), f64::from(i)).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let encoder = Encoder::new()
        .with_signer(Signer::new("k"))
        .with_public_key(RsaPublicKey::from(&private_key));
    let decoder = Decoder::new()
        .with_signer(Signer::new("k"))
        .with_private_key(private_key);

    let payload = encoder.encode_snapshot(&agent.snapshot()).unwrap();
    assert!(payload.encrypted);

    let server = MetricStore::new();
    replay(decoder.decode(&payload).unwrap(), &server);

    assert_eq!(server.get_counter("PollCount").unwrap(), 2000);
    assert_eq!(server.snapshot(), agent.snapshot());
}

#[test]
fn repeated_flushes_accumulate_counters_on_the_server() {
    let agent = MetricStore::new();
    agent.add_counter("PollCount", 3).unwrap();
    agent.set_gauge("Alloc", 1.0).unwrap();
    let server = MetricStore::new();

    let first = Encoder::new().encode_snapshot(&agent.snapshot()).unwrap();
    replay(Decoder::new().decode(&first).unwrap(), &server);

    agent.add_counter("PollCount", 2).unwrap();
    agent.set_gauge("Alloc", 7.0).unwrap();
    let second = Encoder::new().encode_snapshot(&agent.snapshot()).unwrap();
    replay(Decoder::new().decode(&second).unwrap(), &server);

    // The agent sends running totals, the server adds them.
    assert_eq!(server.get_counter("PollCount").unwrap(), 8);
    assert!((server.get_gauge("Alloc").unwrap() - 7.0).abs() < f64::EPSILON);
}

#[test]
fn tampered_payload_is_refused() {
    let payload = Encoder::new()
        .with_signer(Signer::new("k"))
        .encode(&[Metric::counter("PollCount", 1)])
        .unwrap();
    let forged = EncodedPayload {
        signature: Some(Signer::new("other").sign(b"[]").unwrap()),
        ..payload
    };

    let err = Decoder::new()
        .with_signer(Signer::new("k"))
        .decode(&forged)
        .unwrap_err();
    assert!(matches!(err, CoreError::Signature { .. }));
}

#[test]
fn multi_block_encryption_matches_key_size() {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let ciphertext = encrypt(&public_key, &data).unwrap();

    assert_eq!(ciphertext.len() % 128, 0);
    assert!(ciphertext.len() > 128);
    assert_eq!(decrypt(&private_key, &ciphertext).unwrap(), data);
}
