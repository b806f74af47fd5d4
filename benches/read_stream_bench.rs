// Streaming read benchmarks: fully cached scans (fast path) and uncached
// sequential scans with range coalescing, against a no-op buffer manager.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_aio::buffer::{
    BufferManager, BufferManagerRelation, ForkNumber, ReadBuffersOperation,
};
use rusty_aio::common::{BlockNumber, Buffer, INVALID_BLOCK_NUMBER};
use rusty_aio::config::AioConfig;
use rusty_aio::stream::ReadStream;
use std::hint::black_box;

struct NullBufferManager {
    cached: bool,
}

impl BufferManager for NullBufferManager {
    fn start_read_buffers(
        &mut self,
        op: &mut ReadBuffersOperation,
        buffers: &mut [Buffer],
        blocknum: BlockNumber,
        nblocks: &mut usize,
        flags: u32,
    ) -> bool {
        for (i, slot) in buffers.iter_mut().enumerate().take(*nblocks) {
            *slot = Buffer(blocknum + i as BlockNumber + 1);
        }
        op.blocknum = blocknum;
        op.nblocks = *nblocks;
        op.flags = flags;
        !self.cached
    }

    fn wait_read_buffers(&mut self, _op: &mut ReadBuffersOperation) {}

    fn release_buffer(&mut self, _buffer: Buffer) {}

    fn limit_additional_pins(&self, _additional: &mut usize) {}
}

fn scan(nblocks: u32, cached: bool) {
    let config = AioConfig {
        buffer_io_size: 16,
        effective_io_concurrency: 4,
        ..Default::default()
    };
    let bmr = BufferManagerRelation {
        relation: 1,
        tablespace: 1,
        is_temp: false,
    };

    let mut next = 0u32;
    let mut stream = ReadStream::begin(
        &config,
        0,
        None,
        bmr,
        ForkNumber::Main,
        move |_data: &mut [u8]| {
            if next < nblocks {
                next += 1;
                next - 1
            } else {
                INVALID_BLOCK_NUMBER
            }
        },
        0,
        NullBufferManager { cached },
    );

    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        black_box(buffer);
    }
    stream.end();
}

fn bench_streaming_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("streaming_scan");

    for nblocks in [1024u32, 8192] {
        group.bench_with_input(
            BenchmarkId::new("all_cached", nblocks),
            &nblocks,
            |b, &n| b.iter(|| scan(n, true)),
        );
        group.bench_with_input(
            BenchmarkId::new("sequential_uncached", nblocks),
            &nblocks,
            |b, &n| b.iter(|| scan(n, false)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_streaming_scan);
criterion_main!(benches);
