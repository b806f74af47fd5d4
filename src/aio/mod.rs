// # Asynchronous I/O Core
//
// Submission and completion tracking for vectored file I/O shared by every
// backend process of the database. A fixed pool of handles lives in the
// shared control block; each backend owns a contiguous range of that pool
// and moves its handles through an eight-state lifecycle:
//
// ```text
//   IDLE -> HANDED_OUT -> DEFINED -> PREPARED -> IN_FLIGHT -> REAPED
//        -> COMPLETED_SHARED -> (owner reclaim) -> COMPLETED_LOCAL / IDLE
// ```
//
// Any process may drive a handle from IN_FLIGHT to COMPLETED_SHARED (the
// reaper runs the shared completion callbacks); only the owning backend may
// hand out, prepare, or reclaim. Generation counters let a copied handle
// reference detect that its slot was recycled for a different I/O.
//
// ## Architecture
//
// ```text
// ┌──────────────────────────────────────────────────┐
// │        Per-backend view (AioBackend)             │
// │  idle list · staged batch · resource owners      │
// ├──────────────────────────────────────────────────┤
// │        Shared control block (AioControl)         │
// │  handle slots · iovec pools · bounce buffers     │
// ├──────────────────────────────────────────────────┤
// │        I/O method (sync; pluggable)              │
// └──────────────────────────────────────────────────┘
// ```

use crate::error::Result;

mod bounce;
mod control;
mod handle;
mod method;
mod ops;
mod resowner;
mod subject;

pub use bounce::BounceBuffer;
pub use control::{AioBackend, AioBackendStats, AioControl};
pub use handle::{AioHandle, AioHandleRef, HandleState};
pub use ops::{AioOp, AioOpData, IoVec};
pub use resowner::OwnerId;
pub use subject::{
    AioCallbackRegistry, AioLogLevel, AioResult, AioResultStatus, AioReturn, AioSharedCallbackId,
    AioSharedCallbacks, AioSubjectId, AioSubjectInfo, SUBJECT_INVALID,
};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the per-backend submission batch.
pub const SUBMIT_BATCH_SIZE: usize = 32;

/// Maximum number of shared completion callbacks per handle.
pub const AIO_MAX_SHARED_CALLBACKS: usize = 4;

/// Handle targets backend-local buffers; completion must run in the issuing
/// process, so the I/O is executed synchronously regardless of method.
pub const AIO_HF_REFERENCES_LOCAL: u8 = 1 << 0;

/// Shared return value threaded from reclaim back to the issuer.
pub type AioReturnRef = std::sync::Arc<parking_lot::Mutex<AioReturn>>;

/// Create an empty return slot to pass to [`AioBackend::io_get`].
pub fn new_return() -> AioReturnRef {
    std::sync::Arc::new(parking_lot::Mutex::new(AioReturn::default()))
}

/// Initialize the shared control block for a process group.
///
/// Convenience wrapper so callers don't need to name the control type.
pub fn initialize(
    config: &crate::config::AioConfig,
    num_backends: usize,
    registry: AioCallbackRegistry,
) -> Result<std::sync::Arc<AioControl>> {
    AioControl::initialize(config, num_backends, registry)
}
