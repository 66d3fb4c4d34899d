//! Benchmarks for the block ring buffer
//!
//! Measures the cost of one write/read cycle through the buffer for typical
//! transfer sizes, single threaded and with a real producer/consumer pair.
//!
//! Run with: `cargo bench -p common --bench ring_buffer`

use common::RingBuffer;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::thread;

const BLOCK_SIZES: [(&str, usize); 3] = [("16KB", 16 * 1024), ("64KB", 64 * 1024), ("128KB", 128 * 1024)];

fn benchmark_single_thread_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_cycle");

    for (name, size) in BLOCK_SIZES {
        let buffer = RingBuffer::<u8>::with_block_size(64, size).unwrap();
        let data = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("write_read", name), &size, |b, _| {
            b.iter(|| {
                buffer
                    .acquire_write_slot()
                    .lock()
                    .copy_from_slice(black_box(&data));
                buffer.commit_write();

                let block = buffer.acquire_read_slot();
                black_box(block.lock()[0]);
                buffer.commit_read();
            });
        });
    }

    group.finish();
}

fn benchmark_producer_consumer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_threads");
    let blocks = 1024;

    for (name, size) in BLOCK_SIZES {
        group.throughput(Throughput::Bytes((size * blocks) as u64));
        group.bench_with_input(BenchmarkId::new("spsc", name), &size, |b, &size| {
            b.iter(|| {
                let buffer = Arc::new(RingBuffer::<u8>::with_block_size(64, size).unwrap());
                let consumer = {
                    let buffer = Arc::clone(&buffer);
                    thread::spawn(move || {
                        for _ in 0..blocks {
                            let block = buffer.acquire_read_slot();
                            black_box(block.lock()[size - 1]);
                            buffer.commit_read();
                        }
                    })
                };

                for i in 0..blocks {
                    buffer.acquire_write_slot().lock()[0] = i as u8;
                    buffer.commit_write();
                }
                consumer.join().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_single_thread_cycle,
    benchmark_producer_consumer
);
criterion_main!(benches);
