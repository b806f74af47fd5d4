// # Buffer Manager Boundary
//
// The buffer pool is an external collaborator: this crate never evicts and
// never inspects page contents, it only asks the buffer manager to pin
// ranges of blocks and waits for the I/O the buffer manager started. The
// trait here is that seam; the streaming reader is generic over it so that
// scans can be exercised against a scripted implementation.

use crate::common::{BlockNumber, Buffer, TablespaceId, INVALID_BLOCK_NUMBER};

// ============================================================================
// Relation Descriptors
// ============================================================================

/// Which fork of a relation a stream reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkNumber {
    Main,
    FreeSpace,
    VisibilityMap,
    Init,
}

/// Ring-buffer strategy the buffer manager applies while pinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
    BulkRead,
    BulkWrite,
    Vacuum,
}

/// Descriptor of the relation a stream of reads targets.
#[derive(Debug, Clone, Copy)]
pub struct BufferManagerRelation {
    /// Relation file identifier
    pub relation: u32,

    /// Tablespace, for per-tablespace I/O concurrency settings
    pub tablespace: TablespaceId,

    /// Backend-local relation: pins count against the local limit
    pub is_temp: bool,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Issue prefetch advice for the range instead of reading it immediately.
pub const READ_BUFFERS_ISSUE_ADVICE: u32 = 1 << 0;

/// One started (possibly multi-block) read, to be waited on later.
///
/// The relation fields are fixed when a stream begins; the per-read fields
/// are filled in as each read is started.
#[derive(Debug, Clone, Copy)]
pub struct ReadBuffersOperation {
    pub bmr: BufferManagerRelation,
    pub forknum: ForkNumber,
    pub strategy: Option<AccessStrategy>,

    /// First block of the range
    pub blocknum: BlockNumber,

    /// Number of blocks actually covered
    pub nblocks: usize,

    /// Flags the read was started with
    pub flags: u32,
}

impl ReadBuffersOperation {
    pub fn new(
        bmr: BufferManagerRelation,
        forknum: ForkNumber,
        strategy: Option<AccessStrategy>,
    ) -> Self {
        Self {
            bmr,
            forknum,
            strategy,
            blocknum: INVALID_BLOCK_NUMBER,
            nblocks: 0,
            flags: 0,
        }
    }
}

// ============================================================================
// Buffer Manager Trait
// ============================================================================

/// Operations the streaming reader needs from the buffer pool.
pub trait BufferManager {
    /// Pin up to `*nblocks` consecutive blocks starting at `blocknum`,
    /// writing their buffer identifiers into `buffers`. May reduce
    /// `*nblocks` to the number it could pin. Returns whether physical I/O
    /// was started, in which case `wait_read_buffers` must be called on the
    /// operation before the buffers are used. `flags` may carry
    /// [`READ_BUFFERS_ISSUE_ADVICE`] to request prefetch advice rather than
    /// a blocking read.
    fn start_read_buffers(
        &mut self,
        op: &mut ReadBuffersOperation,
        buffers: &mut [Buffer],
        blocknum: BlockNumber,
        nblocks: &mut usize,
        flags: u32,
    ) -> bool;

    /// Wait for the I/O behind a started read.
    fn wait_read_buffers(&mut self, op: &mut ReadBuffersOperation);

    /// Drop one pin.
    fn release_buffer(&mut self, buffer: Buffer);

    /// Clamp `*additional` to this backend's share of pinnable buffers.
    fn limit_additional_pins(&self, additional: &mut usize);

    /// Same, against the backend-local buffer limit.
    fn limit_additional_local_pins(&self, additional: &mut usize) {
        self.limit_additional_pins(additional)
    }
}

/// Whether the platform can issue prefetch advice at all.
pub const ADVICE_SUPPORTED: bool = cfg!(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd"
));
