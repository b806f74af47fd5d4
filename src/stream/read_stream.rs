// # Streaming Read Engine
//
// The stream maintains a circular queue of pinned buffers of size
// `max_pinned_buffers`, ready to be handed to the consumer in callback
// order. A parallel ring carries optional caller-opaque per-buffer data,
// and a third array records, per buffer slot, which outstanding read
// operation must be waited on before the slot's buffer may be returned
// (`-1` when none).
//
// The look-ahead distance classifies the stream into three behaviors:
//
// A) Fully cached: no benefit in looking ahead; distance decays to 1.
// B) Uncached but sequential (or advice unavailable): look ahead up to the
//    physical read size so reads coalesce, but no further.
// C) Uncached and random with advice available: look far enough ahead to
//    keep the configured number of I/Os in flight; distance ramps quickly.
//
// Consecutive callback blocks accumulate in a pending read that is only
// sent to the buffer manager when it can no longer grow (or reaches the
// physical read size). When starting a split read exhausts the I/O budget,
// the block that did not fit is pushed back into a single-slot unget
// buffer and re-consumed on the next look-ahead.

use crate::buffer::{
    AccessStrategy, BufferManager, BufferManagerRelation, ForkNumber, ReadBuffersOperation,
    ADVICE_SUPPORTED, READ_BUFFERS_ISSUE_ADVICE,
};
use crate::common::{BlockNumber, Buffer, INVALID_BLOCK_NUMBER};
use crate::config::AioConfig;
use crate::stream::{READ_STREAM_FULL, READ_STREAM_MAINTENANCE, READ_STREAM_SEQUENTIAL};

/// One started read operation and the buffer slot its range begins at.
struct StreamIo {
    op: ReadBuffersOperation,
    buffer_index: usize,
}

/// A per-consumer streaming reader over one fork of one relation.
pub struct ReadStream<B: BufferManager> {
    max_ios: usize,
    ios_in_progress: usize,
    max_pinned_buffers: usize,
    pinned_buffers: usize,

    /// Current look-ahead target, in blocks. Zero after end-of-stream.
    distance: usize,

    /// Physical read size, in blocks.
    io_size: usize,

    advice_enabled: bool,

    /// Single-slot pushback for flow control when a split read exhausts
    /// the I/O budget.
    have_unget_blocknum: bool,
    unget_blocknum: BlockNumber,

    /// Block source; receives the per-buffer data slot for the block it
    /// returns.
    callback: Box<dyn FnMut(&mut [u8]) -> BlockNumber>,

    /// Successor of the last started read, for sequential detection.
    seq_blocknum: BlockNumber,

    /// The read currently being accumulated.
    pending_read_blocknum: BlockNumber,
    pending_read_nblocks: usize,

    next_io_index: usize,

    /// Next pinned buffer to return.
    oldest_buffer_index: usize,

    /// Next buffer slot to pin into.
    next_buffer_index: usize,

    /// Ring of pinned buffers, with room for one read to overflow the
    /// logical tail by `io_size - 1` so a single read stays contiguous.
    buffers: Box<[Buffer]>,

    per_buffer_data_size: usize,
    per_buffer_data: Box<[u8]>,

    /// Per buffer slot, the index into `ios` to wait on, or -1.
    buffer_io_indexes: Box<[i32]>,

    ios: Box<[StreamIo]>,

    bm: B,
}

impl<B: BufferManager> ReadStream<B> {
    /// Create a streaming reader equivalent to a series of single-block
    /// reads in callback order, internally forming larger vectored reads
    /// where the stream of block numbers allows it.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        config: &AioConfig,
        flags: u32,
        strategy: Option<AccessStrategy>,
        bmr: BufferManagerRelation,
        forknum: ForkNumber,
        callback: impl FnMut(&mut [u8]) -> BlockNumber + 'static,
        per_buffer_data_size: usize,
        bm: B,
    ) -> Self {
        let io_size = config.buffer_io_size;

        // How many I/Os may run at the same time; this also bounds how far
        // we look ahead for opportunities to start more.
        let mut max_ios =
            config.io_concurrency_for(bmr.tablespace, flags & READ_STREAM_MAINTENANCE != 0);

        // Prefetch advice is worth issuing only when the platform supports
        // it, the OS page cache is in play, the caller did not promise
        // sequential access, and concurrency was not configured away.
        let advice_enabled = ADVICE_SUPPORTED
            && !config.io_direct_data
            && flags & READ_STREAM_SEQUENTIAL == 0
            && max_ios > 0;

        // max_ios = 0 means "one read at a time, no advice".
        if max_ios == 0 {
            max_ios = 1;
        }

        // Pin enough to build a full-sized read even when max_ios is
        // small, but never more than this backend's fair share.
        let mut max_pinned_buffers = (max_ios * 4).max(io_size);
        if bmr.is_temp {
            bm.limit_additional_local_pins(&mut max_pinned_buffers);
        } else {
            bm.limit_additional_pins(&mut max_pinned_buffers);
        }
        debug_assert!(max_pinned_buffers > 0);

        // Full-relation scans skip the ramp-up phase and assume full-sized
        // reads from the start (behavior B).
        let distance = if flags & READ_STREAM_FULL != 0 {
            io_size.min(max_pinned_buffers)
        } else {
            1
        };

        let ring_len = max_pinned_buffers + io_size - 1;

        tracing::debug!(
            max_ios,
            max_pinned_buffers,
            distance,
            advice_enabled,
            "begin read stream"
        );

        Self {
            max_ios,
            ios_in_progress: 0,
            max_pinned_buffers,
            pinned_buffers: 0,
            distance,
            io_size,
            advice_enabled,
            have_unget_blocknum: false,
            unget_blocknum: INVALID_BLOCK_NUMBER,
            callback: Box::new(callback),
            seq_blocknum: INVALID_BLOCK_NUMBER,
            pending_read_blocknum: INVALID_BLOCK_NUMBER,
            pending_read_nblocks: 0,
            next_io_index: 0,
            oldest_buffer_index: 0,
            next_buffer_index: 0,
            buffers: vec![Buffer::invalid(); ring_len].into_boxed_slice(),
            per_buffer_data_size,
            per_buffer_data: vec![0u8; per_buffer_data_size * ring_len].into_boxed_slice(),
            buffer_io_indexes: vec![-1; max_pinned_buffers].into_boxed_slice(),
            ios: (0..max_ios)
                .map(|_| StreamIo {
                    op: ReadBuffersOperation::new(bmr, forknum, strategy),
                    buffer_index: 0,
                })
                .collect(),
            bm,
        }
    }

    /// Pull the next pinned buffer out of the stream. Buffers come back in
    /// exactly the order the callback produced their block numbers; the
    /// invalid buffer marks the end of the stream. The pin transfers to
    /// the caller.
    pub fn next(&mut self) -> Buffer {
        // Fast path for all-cached scans: one pinned buffer, no I/O, no
        // look-ahead beyond the next probe, and the caller wants no
        // per-buffer data. Stays in the same buffer slot and skips the
        // ring management entirely.
        if self.ios_in_progress == 0 && self.pinned_buffers == 1 && self.distance == 1 {
            return self.next_fast_path();
        }

        self.next_slow().0
    }

    /// Like [`Self::next`], also returning the per-buffer data the
    /// callback wrote when it produced this buffer's block number.
    pub fn next_with_data(&mut self) -> (Buffer, &[u8]) {
        let (buffer, slot) = self.next_slow();
        let size = self.per_buffer_data_size;
        let data: &[u8] = if buffer.is_valid() && size > 0 {
            &self.per_buffer_data[slot * size..(slot + 1) * size]
        } else {
            &[]
        };
        (buffer, data)
    }

    /// Finish streaming and release every buffer the consumer did not take.
    pub fn end(mut self) -> B {
        // Stop looking ahead.
        self.distance = 0;

        loop {
            let buffer = self.next();
            if !buffer.is_valid() {
                break;
            }
            self.bm.release_buffer(buffer);
        }

        debug_assert_eq!(self.pinned_buffers, 0);
        debug_assert_eq!(self.ios_in_progress, 0);

        self.bm
    }

    /// Current look-ahead distance, in blocks.
    pub fn distance(&self) -> usize {
        self.distance
    }

    /// Buffers currently pinned on behalf of the consumer.
    pub fn pinned_buffers(&self) -> usize {
        self.pinned_buffers
    }

    /// Started reads not yet waited on.
    pub fn ios_in_progress(&self) -> usize {
        self.ios_in_progress
    }

    /// The buffer manager behind this stream.
    pub fn buffer_manager(&self) -> &B {
        &self.bm
    }

    // ------------------------------------------------------------------------
    // Block source
    // ------------------------------------------------------------------------

    /// Ask the callback for the next block, honoring the single-slot
    /// pushback. `buffer_index` selects the per-buffer data slot the
    /// callback may write into; an unget cannot change the slot, so the
    /// data written by the original invocation is still in place.
    fn next_block(&mut self, buffer_index: usize) -> BlockNumber {
        if self.have_unget_blocknum {
            self.have_unget_blocknum = false;
            return self.unget_blocknum;
        }

        if self.per_buffer_data_size == 0 {
            let mut empty: [u8; 0] = [];
            (self.callback)(&mut empty)
        } else {
            let size = self.per_buffer_data_size;
            (self.callback)(&mut self.per_buffer_data[buffer_index * size..(buffer_index + 1) * size])
        }
    }

    /// Defer a block until the next look-ahead, because starting a read
    /// for it now would exceed the I/O budget.
    fn unget_block(&mut self, blocknum: BlockNumber) {
        debug_assert!(!self.have_unget_blocknum);
        self.have_unget_blocknum = true;
        self.unget_blocknum = blocknum;
    }

    // ------------------------------------------------------------------------
    // Starting reads
    // ------------------------------------------------------------------------

    fn start_pending_read(&mut self) {
        debug_assert!(self.pending_read_nblocks > 0);
        debug_assert!(self.pending_read_nblocks <= self.io_size);
        debug_assert!(self.pinned_buffers + self.pending_read_nblocks <= self.max_pinned_buffers);

        // Advice is pointless for a strictly sequential pattern, and too
        // late to help for the first read of the stream.
        let flags = if self.advice_enabled
            && self.seq_blocknum != INVALID_BLOCK_NUMBER
            && self.pending_read_blocknum != self.seq_blocknum
        {
            READ_BUFFERS_ISSUE_ADVICE
        } else {
            0
        };

        let buffer_index = self.next_buffer_index;
        let io_index = self.next_io_index;

        // We say how many blocks we want; the buffer manager may pin fewer.
        let mut nblocks = self.pending_read_nblocks;
        self.ios[io_index].op.blocknum = self.pending_read_blocknum;
        self.ios[io_index].op.flags = flags;
        let need_wait = self.bm.start_read_buffers(
            &mut self.ios[io_index].op,
            &mut self.buffers[buffer_index..buffer_index + nblocks],
            self.pending_read_blocknum,
            &mut nblocks,
            flags,
        );
        self.ios[io_index].op.blocknum = self.pending_read_blocknum;
        self.ios[io_index].op.nblocks = nblocks;
        self.ios[io_index].op.flags = flags;
        self.ios[io_index].buffer_index = buffer_index;

        self.pinned_buffers += nblocks;

        if !need_wait {
            debug_assert_eq!(self.buffer_io_indexes[buffer_index], -1);

            // Fully cached: look-ahead distance decays (behavior A).
            if self.distance > 1 {
                self.distance -= 1;
            }
        } else {
            // Wait before returning the head buffer of this range; the
            // distance is adjusted after the wait.
            self.buffer_io_indexes[buffer_index] = io_index as i32;

            self.next_io_index += 1;
            if self.next_io_index == self.max_ios {
                self.next_io_index = 0;
            }

            debug_assert!(self.ios_in_progress < self.max_ios);
            self.ios_in_progress += 1;
        }

        // The read was given contiguous buffer space that may run past the
        // logical ring tail; slide the overflow to the front so the ring
        // stays dense.
        let end = buffer_index + nblocks;
        if end > self.max_pinned_buffers {
            let overflow = end - self.max_pinned_buffers;
            self.buffers
                .copy_within(self.max_pinned_buffers..self.max_pinned_buffers + overflow, 0);
        }

        // Where a strictly sequential stream would continue.
        self.seq_blocknum = self.pending_read_blocknum + nblocks as BlockNumber;

        let mut next_index = buffer_index + nblocks;
        if next_index >= self.max_pinned_buffers {
            next_index -= self.max_pinned_buffers;
        }
        debug_assert!(next_index < self.max_pinned_buffers);
        self.next_buffer_index = next_index;

        // A short read carries the remainder into the next pending read.
        self.pending_read_blocknum += nblocks as BlockNumber;
        self.pending_read_nblocks -= nblocks;
    }

    fn look_ahead(&mut self) {
        while self.ios_in_progress < self.max_ios
            && self.pinned_buffers + self.pending_read_nblocks < self.distance
        {
            if self.pending_read_nblocks == self.io_size {
                self.start_pending_read();
                continue;
            }

            // Index of the pending read's next block, with wrap-around.
            let mut buffer_index = self.next_buffer_index + self.pending_read_nblocks;
            if buffer_index >= self.max_pinned_buffers {
                buffer_index -= self.max_pinned_buffers;
            }

            let blocknum = self.next_block(buffer_index);
            if blocknum == INVALID_BLOCK_NUMBER {
                // End of stream.
                self.distance = 0;
                break;
            }

            // Does it extend the pending read by exactly one block?
            if self.pending_read_nblocks > 0
                && self.pending_read_blocknum + self.pending_read_nblocks as BlockNumber
                    == blocknum
            {
                self.pending_read_nblocks += 1;
                continue;
            }

            // The pending read has to be started before another can form.
            if self.pending_read_nblocks > 0 {
                self.start_pending_read();
                if self.ios_in_progress == self.max_ios {
                    // Budget exhausted; rewind and stop here.
                    self.unget_block(blocknum);
                    return;
                }
            }

            self.pending_read_blocknum = blocknum;
            self.pending_read_nblocks = 1;
        }

        // Usually the pending read is left to grow as more buffers are
        // consumed, but when it cannot possibly grow further, start it now.
        if self.pending_read_nblocks > 0
            && (self.distance == self.pending_read_nblocks || self.distance == 0)
            && self.ios_in_progress < self.max_ios
        {
            self.start_pending_read();
        }
    }

    // ------------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------------

    fn next_fast_path(&mut self) -> Buffer {
        let oldest_buffer_index = self.oldest_buffer_index;
        let buffer = self.buffers[oldest_buffer_index];
        debug_assert!(buffer.is_valid());

        // Serve the held buffer, but probe the next block first. The same
        // buffer slot and I/O slot 0, which must be free, are reused.
        let next_blocknum = self.next_block(oldest_buffer_index);
        if next_blocknum == INVALID_BLOCK_NUMBER {
            // End of stream; the pin transfers to the caller.
            self.distance = 0;
            self.pinned_buffers = 0;
            self.oldest_buffer_index = self.next_buffer_index;
            return buffer;
        }

        let flags = if self.advice_enabled {
            READ_BUFFERS_ISSUE_ADVICE
        } else {
            0
        };
        let mut nblocks = 1;
        self.ios[0].op.blocknum = next_blocknum;
        self.ios[0].op.flags = flags;
        let need_wait = self.bm.start_read_buffers(
            &mut self.ios[0].op,
            &mut self.buffers[oldest_buffer_index..oldest_buffer_index + 1],
            next_blocknum,
            &mut nblocks,
            flags,
        );
        self.ios[0].op.blocknum = next_blocknum;
        self.ios[0].op.nblocks = nblocks;
        self.ios[0].op.flags = flags;

        if need_wait {
            // I/O needed: remember it and take the slow path next time.
            self.ios[0].buffer_index = oldest_buffer_index;
            self.buffer_io_indexes[oldest_buffer_index] = 0;
            self.ios_in_progress = 1;
            self.next_io_index = if self.max_ios > 1 { 1 } else { 0 };
            self.seq_blocknum = next_blocknum + 1;

            // Move towards behavior B/C.
            self.distance = 2.min(self.max_pinned_buffers);
        }

        // Pin transferred to the caller, got another one: no net change.
        debug_assert_eq!(self.pinned_buffers, 1);
        buffer
    }

    fn next_slow(&mut self) -> (Buffer, usize) {
        if self.pinned_buffers == 0 {
            debug_assert_eq!(self.oldest_buffer_index, self.next_buffer_index);

            // End of stream already reached?
            if self.distance == 0 {
                return (Buffer::invalid(), 0);
            }

            // The usual order is to look ahead at the bottom of this
            // function, but after the fast path or at the very start the
            // handle has to be cranked to get going.
            self.look_ahead();

            if self.pinned_buffers == 0 {
                debug_assert_eq!(self.distance, 0);
                return (Buffer::invalid(), 0);
            }
        }

        debug_assert!(self.pinned_buffers > 0);
        let oldest_buffer_index = self.oldest_buffer_index;
        debug_assert!(oldest_buffer_index < self.max_pinned_buffers);
        let buffer = self.buffers[oldest_buffer_index];
        debug_assert!(buffer.is_valid());

        // Wait for the read covering this buffer, if any, and let its
        // outcome steer the look-ahead distance.
        if self.ios_in_progress > 0 && self.buffer_io_indexes[oldest_buffer_index] >= 0 {
            let io_index = self.buffer_io_indexes[oldest_buffer_index] as usize;
            debug_assert_eq!(self.ios[io_index].buffer_index, oldest_buffer_index);

            let with_advice = self.ios[io_index].op.flags & READ_BUFFERS_ISSUE_ADVICE != 0;
            self.bm.wait_read_buffers(&mut self.ios[io_index].op);

            // Clear for the next user of this slot, so the no-I/O path
            // never has to maintain these entries.
            self.buffer_io_indexes[oldest_buffer_index] = -1;

            debug_assert!(self.ios_in_progress > 0);
            self.ios_in_progress -= 1;

            if with_advice {
                // Random I/O with advice: ramp quickly (behavior C).
                self.distance = (self.distance * 2).min(self.max_pinned_buffers);
            } else if self.distance > self.io_size {
                // No advice: decay back towards the physical read size.
                self.distance -= 1;
            } else {
                // Ramp up to the physical read size (behavior B).
                self.distance = (self.distance * 2)
                    .min(self.io_size)
                    .min(self.max_pinned_buffers);
            }
        }

        #[cfg(debug_assertions)]
        {
            self.buffers[oldest_buffer_index] = Buffer::invalid();
        }

        // Pin transferred to the caller.
        self.pinned_buffers -= 1;

        self.oldest_buffer_index += 1;
        if self.oldest_buffer_index == self.max_pinned_buffers {
            self.oldest_buffer_index = 0;
        }

        // Refill the window for the next call.
        self.look_ahead();

        (buffer, oldest_buffer_index)
    }
}
