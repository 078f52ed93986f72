use sib_crypto::{KeyHandler, MasterSecret, SecretRecord};

const SUITES: [&str; 3] = [
    "x25519;xchacha20-poly1305;;;;",
    "secp256r1;aes-256-gcm;x25519;chacha20-poly1305;;",
    "secp384r1;aes-256-siv;secp256r1;aes-256-gcm;x25519;xchacha20-poly1305",
];

fn key_handler(stages: usize) -> KeyHandler {
    let ms = MasterSecret::from_bytes([0x42u8; 64]);
    KeyHandler::new(&ms, SUITES[stages - 1].parse().unwrap()).unwrap()
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1, 2, 3])]
fn bench_onion_encrypt(bencher: divan::Bencher, stages: usize) {
    let kh = key_handler(stages);
    let data = make_data(1024);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| kh.encrypt_field(divan::black_box(&data)).unwrap());
}

#[divan::bench(args = [1, 2, 3])]
fn bench_onion_decrypt(bencher: divan::Bencher, stages: usize) {
    let kh = key_handler(stages);
    let data = make_data(1024);
    let encrypted = kh.encrypt_field(&data).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| kh.decrypt_field(divan::black_box(&encrypted)).unwrap());
}

#[divan::bench]
fn bench_record_seal_and_pickle(bencher: divan::Bencher) {
    let kh = key_handler(1);
    bencher.bench(|| {
        SecretRecord::encrypt(&kh, divan::black_box(&["github", "alice", "hunter2"]))
            .unwrap()
            .to_bytes()
            .unwrap()
    });
}

fn main() {
    divan::main();
}
