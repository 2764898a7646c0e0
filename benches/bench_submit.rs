// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Host-side protocol overhead benchmarks over the software simulator.
//!
//! With the echo role standing in for the hardware, these numbers measure
//! the scheduling, framing, slicing and reassembly cost per submission,
//! not device execution time.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use catapult_rust::sim::{SimDriver, SimOptions};
use catapult_rust::CatapultSession;

fn session(rt: &Runtime, buffer_count: u32, buffer_size: u32) -> CatapultSession {
    let driver = Arc::new(SimDriver::new(SimOptions {
        buffer_count,
        buffer_size,
        ..SimOptions::default()
    }));
    rt.block_on(CatapultSession::with_driver(driver))
        .expect("simulated session")
}

/// Single-frame submissions across payload sizes.
fn bench_single_frame(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    // 64 KiB buffers: every size below fits in one slot.
    let session = session(&rt, 8, 64 * 1024);

    let sizes: Vec<usize> = vec![
        256,
        1024,      // 1 KB
        4 * 1024,  // 4 KB
        16 * 1024, // 16 KB
        60 * 1024, // just under one slot
    ];

    let mut group = c.benchmark_group("submit_single");
    for size in sizes {
        let payload: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| rt.block_on(session.submit(1, payload)).unwrap());
        });
    }
    group.finish();

    rt.block_on(session.close()).unwrap();
}

/// Sliced submissions, including the overflow path.
fn bench_sliced(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    // 4 slots of 4080-byte payload capacity.
    let session = session(&rt, 4, 4096);
    let capacity = session.slot_payload_capacity();

    let cases: Vec<(&str, usize)> = vec![
        ("3_slices", capacity * 3),        // within the slot pool
        ("16_slices", capacity * 16),      // overflow: batched receives
    ];

    let mut group = c.benchmark_group("submit_sliced");
    for (label, size) in cases {
        let payload: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &payload, |b, payload| {
            b.iter(|| rt.block_on(session.submit(1, payload)).unwrap());
        });
    }
    group.finish();

    rt.block_on(session.close()).unwrap();
}

criterion_group!(benches, bench_single_frame, bench_sliced);
criterion_main!(benches);
