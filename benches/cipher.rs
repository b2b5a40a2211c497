//! Benchmarks for the AES backends and tunnel layer cipher.
//!
//! Run with: cargo bench --bench cipher

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shroud::crypto::{cbc_decrypt, cbc_encrypt, ecb_encrypt, TUNNEL_DATA_SIZE};
use shroud::{Aes256, CipherBackend, TunnelCipher};

const KEY: [u8; 32] = [0x42; 32];
const IV_KEY: [u8; 32] = [0x24; 32];
const IV: [u8; 16] = [0x07; 16];

fn backends() -> Vec<CipherBackend> {
    [CipherBackend::Hardware, CipherBackend::Portable]
        .into_iter()
        .filter(|b| b.is_available())
        .collect()
}

// ===== Block mode Benchmarks =====

fn bench_ecb(c: &mut Criterion) {
    let mut group = c.benchmark_group("ecb_encrypt");

    for backend in backends() {
        let Ok(cipher) = Aes256::with_backend(backend, &KEY) else {
            continue;
        };
        for &len in &[16usize, 1024, 16384] {
            let mut data = vec![0u8; len];
            group.throughput(Throughput::Bytes(len as u64));
            group.bench_with_input(BenchmarkId::new(backend.to_string(), len), &len, |b, _| {
                b.iter(|| ecb_encrypt(&cipher, black_box(&mut data)))
            });
        }
    }

    group.finish();
}

fn bench_cbc(c: &mut Criterion) {
    let mut group = c.benchmark_group("cbc");

    for backend in backends() {
        let Ok(cipher) = Aes256::with_backend(backend, &KEY) else {
            continue;
        };
        // Typical SSU datagram body
        let mut data = vec![0u8; 1440];
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(BenchmarkId::new("encrypt", backend), |b| {
            b.iter(|| cbc_encrypt(&cipher, &IV, black_box(&mut data)))
        });
        // Decryption pipelines across blocks, unlike encryption
        group.bench_function(BenchmarkId::new("decrypt", backend), |b| {
            b.iter(|| cbc_decrypt(&cipher, &IV, black_box(&mut data)))
        });
    }

    group.finish();
}

// ===== Tunnel Benchmarks =====

fn bench_tunnel(c: &mut Criterion) {
    let mut group = c.benchmark_group("tunnel_layer");
    group.throughput(Throughput::Bytes(TUNNEL_DATA_SIZE as u64));

    for backend in backends() {
        let Ok(cipher) = TunnelCipher::with_backend(backend, &KEY, &IV_KEY) else {
            continue;
        };
        let mut msg = [0x5au8; TUNNEL_DATA_SIZE];
        group.bench_function(BenchmarkId::new("encrypt", backend), |b| {
            b.iter(|| cipher.encrypt(black_box(&mut msg)))
        });
        group.bench_function(BenchmarkId::new("decrypt", backend), |b| {
            b.iter(|| cipher.decrypt(black_box(&mut msg)))
        });
    }

    group.finish();
}

// Eight hops peeling a message, as an outbound endpoint would
fn bench_tunnel_path(c: &mut Criterion) {
    let hops: Vec<TunnelCipher> = (0u8..8)
        .map(|i| TunnelCipher::new(&[i; 32], &[i ^ 0xff; 32]))
        .collect();
    let mut msg = [0u8; TUNNEL_DATA_SIZE];

    c.bench_function("tunnel_path_8_hops", |b| {
        b.iter(|| {
            for hop in &hops {
                hop.decrypt(black_box(&mut msg));
            }
        })
    });
}

criterion_group!(benches, bench_ecb, bench_cbc, bench_tunnel, bench_tunnel_path);
criterion_main!(benches);
