use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use meshbus_crypto::ed25519::Ed25519PrivateKey;
use meshbus_crypto::hkdf::hkdf;
use meshbus_crypto::hmac::hmac_sha256;
use meshbus_crypto::x25519::X25519PrivateKey;
use meshbus_crypto::{CryptoHash, HashAlgorithm, SessionCipher};

fn bench_transcript(c: &mut Criterion) {
    let mut group = c.benchmark_group("transcript");
    let message = vec![0xABu8; 256];

    group.throughput(Throughput::Bytes(message.len() as u64));
    group.bench_function("update_and_snapshot", |b| {
        let mut hash = CryptoHash::digest(HashAlgorithm::Sha256);
        b.iter(|| {
            hash.update(&message).unwrap();
            hash.finish(true).unwrap()
        });
    });
    group.bench_function("hmac_sha256_256B", |b| {
        b.iter(|| hmac_sha256(&[0x42; 32], &message));
    });
    group.bench_function("hkdf_64B_output", |b| {
        b.iter(|| hkdf(64, &[0x55; 32], Some(&[0x11; 32]), Some(b"bench")).unwrap());
    });

    group.finish();
}

fn bench_session_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_cipher");
    let cipher = SessionCipher::new(&[0x42u8; 64]);

    for size in [64usize, 1024, 65536] {
        let data = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("seal", size), &data, |b, d| {
            b.iter(|| cipher.seal(d));
        });
        let sealed = cipher.seal(&data);
        group.bench_with_input(BenchmarkId::new("open", size), &sealed, |b, s| {
            b.iter(|| cipher.open(s).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("sign", size), &data, |b, d| {
            b.iter(|| cipher.sign(d));
        });
    }

    group.finish();
}

fn bench_asymmetric(c: &mut Criterion) {
    let mut group = c.benchmark_group("asymmetric");

    let ours = X25519PrivateKey::generate();
    let theirs = X25519PrivateKey::generate().public_key();
    group.bench_function("x25519_diffie_hellman", |b| {
        b.iter(|| ours.diffie_hellman(&theirs));
    });

    let signer = Ed25519PrivateKey::generate();
    let verifier = signer.public_key();
    let signature = signer.sign(b"key info");
    group.bench_function("ed25519_sign", |b| {
        b.iter(|| signer.sign(b"key info"));
    });
    group.bench_function("ed25519_verify", |b| {
        b.iter(|| verifier.verify(b"key info", &signature).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_transcript, bench_session_cipher, bench_asymmetric);
criterion_main!(benches);
