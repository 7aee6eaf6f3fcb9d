//! Performance benchmarks for the hashing hot path

use criterion::{criterion_group, criterion_main, Criterion};
use powerplant::crypto::{leading_zero_bits, CanonicalTemplate};
use powerplant::{Difficulty, Event, Nonce};
use std::hint::black_box;

fn sample_event() -> Event {
    Event {
        id: None,
        created_at: 1_700_000_000,
        kind: 1,
        tags: vec![
            vec!["t".to_string(), "nostr".to_string()],
            vec!["p".to_string(), "f".repeat(64)],
        ],
        content: "Hello, World! ".repeat(20),
        pubkey: "e".repeat(64),
    }
}

fn bench_template_digest(c: &mut Criterion) {
    let template = CanonicalTemplate::new(&sample_event(), Difficulty(20)).unwrap();
    let mut nonce = 0u64;

    c.bench_function("template_digest", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            black_box(template.digest(Nonce::new(nonce)));
        });
    });
}

fn bench_full_commitment(c: &mut Criterion) {
    let mut event = sample_event();
    event.push_nonce_tag(Nonce::new(123_456_789), Difficulty(20));

    c.bench_function("full_commitment_digest", |b| {
        b.iter(|| {
            black_box(event.digest().unwrap());
        });
    });
}

fn bench_leading_zero_bits(c: &mut Criterion) {
    let hash = [0x00, 0x00, 0x0F, 0xAB, 0xCD, 0xEF, 0x12, 0x34];

    c.bench_function("leading_zero_bits", |b| {
        b.iter(|| {
            black_box(leading_zero_bits(black_box(&hash)));
        });
    });
}

criterion_group!(
    benches,
    bench_template_digest,
    bench_full_commitment,
    bench_leading_zero_bits
);
criterion_main!(benches);
