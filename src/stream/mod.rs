// # Streaming Read-Ahead
//
// Buffer access with look-ahead: a consumer that would otherwise pin blocks
// one at a time hands the stream a callback producing block numbers, and
// the stream coalesces consecutive numbers into larger vectored reads,
// issues prefetch advice or reads ahead of consumption, and adapts how far
// it looks ahead to the observed behavior of the block source.

mod read_stream;

pub use read_stream::ReadStream;

/// The stream serves maintenance work; the maintenance I/O concurrency
/// setting applies.
pub const READ_STREAM_MAINTENANCE: u32 = 1 << 0;

/// The caller promises sequential access, suppressing prefetch advice
/// regardless of what the heuristics would detect.
pub const READ_STREAM_SEQUENTIAL: u32 = 1 << 1;

/// The caller expects to read the whole relation: skip the initial ramp-up
/// and assume full-sized reads from the start.
pub const READ_STREAM_FULL: u32 = 1 << 2;
