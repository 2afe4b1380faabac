//! Packet buffer throughput: write + read of one frame, single thread
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spsc_pbuf::{Consumer, Producer, RingFlags, SharedMemory, WordConsumer, WordProducer};

fn frame_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("write-read");

    for len in [16usize, 64, 256, 1024] {
        let mut mem = SharedMemory::new(4096);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();
        let payload = vec![0x42u8; len];
        let mut buf = vec![0u8; len];

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                producer.write(black_box(&payload)).unwrap();
                black_box(consumer.read(&mut buf).unwrap());
            })
        });
    }

    group.finish();
}

fn word_bench(c: &mut Criterion) {
    let mut mem = SharedMemory::new(256);
    let (tx, rx) = mem.split();
    let mut producer = WordProducer::init(tx).unwrap();
    let mut consumer = WordConsumer::attach(rx).unwrap();

    c.bench_function("word-push-pop", |b| {
        b.iter(|| {
            producer.push(black_box(17)).unwrap();
            black_box(consumer.pop());
        })
    });
}

criterion_group!(benches, frame_bench, word_bench);
criterion_main!(benches);
