// Streaming read-ahead end-to-end tests against a scripted buffer manager:
// block ordering, range coalescing, short reads, flow-control pushback, and
// the three distance-control regimes.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rusty_aio::buffer::{
    BufferManager, BufferManagerRelation, ForkNumber, ReadBuffersOperation,
    READ_BUFFERS_ISSUE_ADVICE,
};
use rusty_aio::common::{BlockNumber, Buffer, INVALID_BLOCK_NUMBER};
use rusty_aio::config::AioConfig;
use rusty_aio::stream::{ReadStream, READ_STREAM_FULL};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Scripted Buffer Manager
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct StartCall {
    blocknum: BlockNumber,
    requested: usize,
    granted: usize,
    flags: u32,
    need_wait: bool,
}

#[derive(Default)]
struct MockState {
    /// Blocks that are already in the buffer pool.
    cached: HashSet<BlockNumber>,

    /// Maximum blocks granted for a request starting at a given block.
    grant_limit: HashMap<BlockNumber, usize>,

    /// Clamp applied by `limit_additional_pins`; 0 means unlimited.
    pin_limit: usize,

    starts: Vec<StartCall>,
    waits: usize,
    released: Vec<Buffer>,
}

#[derive(Clone)]
struct MockBufferManager {
    state: Arc<Mutex<MockState>>,
}

impl MockBufferManager {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn with_cached(blocks: impl IntoIterator<Item = BlockNumber>) -> Self {
        let bm = Self::new();
        bm.state.lock().cached.extend(blocks);
        bm
    }
}

/// Buffer identifiers encode the block number so tests can map back.
fn buffer_for(blocknum: BlockNumber) -> Buffer {
    Buffer(blocknum + 1)
}

fn block_of(buffer: Buffer) -> BlockNumber {
    buffer.0 - 1
}

impl BufferManager for MockBufferManager {
    fn start_read_buffers(
        &mut self,
        op: &mut ReadBuffersOperation,
        buffers: &mut [Buffer],
        blocknum: BlockNumber,
        nblocks: &mut usize,
        flags: u32,
    ) -> bool {
        let mut state = self.state.lock();

        let requested = *nblocks;
        let mut granted = requested;
        if let Some(&limit) = state.grant_limit.get(&blocknum) {
            granted = granted.min(limit);
        }
        assert!(granted >= 1);
        assert!(granted <= buffers.len());

        let mut need_wait = false;
        for (i, slot) in buffers.iter_mut().enumerate().take(granted) {
            let block = blocknum + i as BlockNumber;
            *slot = buffer_for(block);
            if !state.cached.contains(&block) {
                need_wait = true;
            }
        }

        *nblocks = granted;
        op.blocknum = blocknum;
        op.nblocks = granted;
        op.flags = flags;

        state.starts.push(StartCall {
            blocknum,
            requested,
            granted,
            flags,
            need_wait,
        });

        need_wait
    }

    fn wait_read_buffers(&mut self, _op: &mut ReadBuffersOperation) {
        self.state.lock().waits += 1;
    }

    fn release_buffer(&mut self, buffer: Buffer) {
        self.state.lock().released.push(buffer);
    }

    fn limit_additional_pins(&self, additional: &mut usize) {
        let limit = self.state.lock().pin_limit;
        if limit > 0 {
            *additional = (*additional).min(limit);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_relation() -> BufferManagerRelation {
    BufferManagerRelation {
        relation: 1,
        tablespace: 1,
        is_temp: false,
    }
}

fn block_source(blocks: Vec<BlockNumber>) -> impl FnMut(&mut [u8]) -> BlockNumber + 'static {
    let mut iter = blocks.into_iter();
    move |_data: &mut [u8]| iter.next().unwrap_or(INVALID_BLOCK_NUMBER)
}

fn config(io_size: usize, concurrency: usize) -> AioConfig {
    AioConfig {
        buffer_io_size: io_size,
        effective_io_concurrency: concurrency,
        ..Default::default()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

// A fully cached scan never starts I/O, keeps distance at 1, and returns
// every block in callback order.
#[test]
fn test_all_cached_scan() {
    let blocks: Vec<BlockNumber> = (100..200).collect();
    let bm = MockBufferManager::with_cached(blocks.iter().copied());
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(8, 1),
        0,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        assert_eq!(stream.ios_in_progress(), 0);
        assert!(stream.distance() <= 1);
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);

    let state = state.lock();
    assert_eq!(state.waits, 0);
    assert!(state.starts.iter().all(|s| !s.need_wait));
}

// A sequential uncached scan never issues advice (the next range is always
// the successor of the last) and ramps the distance up to the physical
// read size, coalescing blocks into larger reads as it grows.
#[test]
fn test_sequential_uncached_scan() {
    let blocks: Vec<BlockNumber> = (200..300).collect();
    let bm = MockBufferManager::new();
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(4, 1),
        0,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    let mut max_distance = 0;
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        max_distance = max_distance.max(stream.distance());
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);
    assert_eq!(max_distance, 4);

    let state = state.lock();
    assert!(state.starts.iter().all(|s| s.flags == 0));
    assert!(state.starts.iter().all(|s| s.need_wait));
    // Coalescing must beat one-call-per-block, but cannot beat the
    // physical read size.
    assert!(state.starts.len() < 100);
    assert!(state.starts.len() >= 100 / 4);
}

// With the full-relation flag the stream starts at full distance, so a run
// of k consecutive blocks (k == io_size) becomes exactly one read.
#[test]
fn test_full_scan_merges_into_io_sized_reads() {
    let blocks: Vec<BlockNumber> = (0..64).collect();
    let bm = MockBufferManager::new();
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(8, 1),
        READ_STREAM_FULL,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);

    let state = state.lock();
    assert_eq!(state.starts.len(), 8);
    for (i, call) in state.starts.iter().enumerate() {
        assert_eq!(call.blocknum, i as BlockNumber * 8);
        assert_eq!(call.granted, 8);
    }
}

// Random uncached access with advice available: singleton ranges, advice
// on everything after the first read, concurrency bounded by max_ios, and
// a distance that doubles past 4 * max_ios.
#[test]
fn test_random_uncached_with_advice() {
    let blocks: Vec<BlockNumber> = (0..40).map(|i| 1000 + i * 5).collect();
    let bm = MockBufferManager::new();
    let state = bm.state.clone();

    let max_ios = 4;
    let mut stream = ReadStream::begin(
        &config(4, max_ios),
        0,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    let mut max_distance = 0;
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        assert!(stream.ios_in_progress() <= max_ios);
        max_distance = max_distance.max(stream.distance());
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);
    assert!(max_distance >= 4 * max_ios);

    let state = state.lock();
    assert!(state.starts.iter().all(|s| s.granted == 1));
    // Too late to benefit on the first read; advice everywhere after.
    assert_eq!(state.starts[0].flags, 0);
    assert!(state.starts[1..]
        .iter()
        .all(|s| s.flags & READ_BUFFERS_ISSUE_ADVICE != 0));
}

// A short read carries the unpinned remainder into the next pending read.
#[test]
fn test_short_read_carries_remainder() {
    let blocks: Vec<BlockNumber> = (0..8).collect();
    let bm = MockBufferManager::new();
    bm.state.lock().grant_limit.insert(0, 3);
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(8, 2),
        READ_STREAM_FULL,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);

    let state = state.lock();
    assert_eq!(state.starts.len(), 2);
    assert_eq!(state.starts[0].blocknum, 0);
    assert_eq!(state.starts[0].requested, 8);
    assert_eq!(state.starts[0].granted, 3);
    assert_eq!(state.starts[1].blocknum, 3);
    assert_eq!(state.starts[1].requested, 5);
    assert_eq!(state.starts[1].granted, 5);
}

// When starting a split read exhausts the I/O budget, the block that did
// not fit is pushed back and re-consumed after the first read completes.
#[test]
fn test_unget_on_budget_exhaustion() {
    let blocks: Vec<BlockNumber> = vec![10, 20, 21];
    let bm = MockBufferManager::new();
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(4, 1),
        READ_STREAM_FULL,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);

    let state = state.lock();
    assert_eq!(state.starts.len(), 2);
    assert_eq!((state.starts[0].blocknum, state.starts[0].granted), (10, 1));
    assert_eq!((state.starts[1].blocknum, state.starts[1].granted), (20, 2));
}

// The per-buffer data returned for buffer k is what the callback wrote on
// invocation k, even when blocks arrive in arbitrary order.
#[test]
fn test_per_buffer_data_association() {
    let mut blocks: Vec<BlockNumber> = (0..50).map(|i| i * 7).collect();
    blocks.shuffle(&mut rand::rng());

    let bm = MockBufferManager::with_cached(blocks.iter().copied());

    let mut iter = blocks.clone().into_iter();
    let callback = move |data: &mut [u8]| match iter.next() {
        Some(block) => {
            data.copy_from_slice(&block.to_le_bytes());
            block
        }
        None => INVALID_BLOCK_NUMBER,
    };

    let mut stream = ReadStream::begin(
        &config(4, 2),
        0,
        None,
        test_relation(),
        ForkNumber::Main,
        callback,
        std::mem::size_of::<BlockNumber>(),
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let (buffer, data) = stream.next_with_data();
        if !buffer.is_valid() {
            break;
        }
        let block = block_of(buffer);
        assert_eq!(data, block.to_le_bytes());
        returned.push(block);
    }
    stream.end();

    assert_eq!(returned, blocks);
}

// Ending a stream early releases every buffer the consumer did not take.
#[test]
fn test_end_releases_unconsumed_buffers() {
    let blocks: Vec<BlockNumber> = (0..32).collect();
    let bm = MockBufferManager::with_cached(blocks.iter().copied());
    let state = bm.state.clone();

    let mut stream = ReadStream::begin(
        &config(8, 1),
        READ_STREAM_FULL,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks),
        0,
        bm,
    );

    let mut consumed = HashSet::new();
    for _ in 0..5 {
        let buffer = stream.next();
        assert!(buffer.is_valid());
        consumed.insert(buffer);
    }
    stream.end();

    let state = state.lock();
    assert!(!state.released.is_empty());
    for buffer in &state.released {
        assert!(!consumed.contains(buffer), "released a consumed buffer");
    }
    let unique: HashSet<_> = state.released.iter().collect();
    assert_eq!(unique.len(), state.released.len());
}

// Regime A convergence: even a stream that starts at full distance decays
// to single-block look-ahead once everything turns out to be cached.
#[test]
fn test_distance_decays_to_one_when_cached() {
    let blocks: Vec<BlockNumber> = (0..64).collect();
    let bm = MockBufferManager::with_cached(blocks.iter().copied());

    let mut stream = ReadStream::begin(
        &config(8, 1),
        READ_STREAM_FULL,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks),
        0,
        bm,
    );

    let mut converged_after = None;
    for i in 0..60 {
        let buffer = stream.next();
        assert!(buffer.is_valid());
        if stream.distance() == 1 {
            converged_after = Some(i);
            break;
        }
    }
    stream.end();

    assert!(converged_after.is_some(), "distance never reached 1");
}

// The pin limit reported by the buffer manager caps the look-ahead window.
#[test]
fn test_pin_limit_caps_window() {
    let blocks: Vec<BlockNumber> = (0..64).map(|i| i * 3).collect();
    let bm = MockBufferManager::new();
    bm.state.lock().pin_limit = 6;

    let mut stream = ReadStream::begin(
        &config(4, 8),
        0,
        None,
        test_relation(),
        ForkNumber::Main,
        block_source(blocks.clone()),
        0,
        bm,
    );

    let mut returned = Vec::new();
    loop {
        let buffer = stream.next();
        if !buffer.is_valid() {
            break;
        }
        assert!(stream.pinned_buffers() <= 6);
        assert!(stream.distance() <= 6);
        returned.push(block_of(buffer));
    }
    stream.end();

    assert_eq!(returned, blocks);
}
