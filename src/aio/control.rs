// # Shared Control Block & Per-Backend View
//
// All state shared between backend processes lives in `AioControl`: the
// dense handle array, the iovec pools (each handle owns a window of
// `io_combine_limit` slots at a fixed offset), the bounce buffer pool, and
// the subject/callback tables that must be identical in every process.
//
// `AioBackend` is one process's private view: the idle lists, the staged
// submission batch, the at-most-one handed-out handle and bounce buffer,
// and the resource-owner arena. It is created once at process start by
// `AioControl::attach` and threaded through every public operation.

use crate::aio::bounce::BounceBufferSlot;
use crate::aio::handle::AioHandleSlot;
use crate::aio::resowner::OwnerArena;
use crate::aio::subject::{AioCallbackRegistry, AioSharedCallbacks, AioSubjectInfo};
use crate::aio::{AioReturnRef, OwnerId, SUBMIT_BATCH_SIZE};
use crate::common::ProcNumber;
use crate::config::{AioConfig, IoMethodKind};
use crate::error::{AioError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Iovec Pool
// ============================================================================

/// One gather/scatter segment descriptor in the shared iovec pool.
///
/// The owner fills its handle's window before publishing `IN_FLIGHT`; the
/// executing process reads it after observing that state, so the fields can
/// be relaxed atomics ordered by the state transition itself.
pub(crate) struct IovecSlot {
    pub(crate) base: AtomicUsize,
    pub(crate) len: AtomicUsize,
}

impl IovecSlot {
    fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }
}

// ============================================================================
// Shared Control Block
// ============================================================================

/// Shared-memory control block for the AIO subsystem, one per process group.
pub struct AioControl {
    /// Dense array of handles; backend B owns indices
    /// `[B * per_backend, (B + 1) * per_backend)`.
    pub(crate) handles: Box<[AioHandleSlot]>,

    /// Segment descriptors, `io_combine_limit` per handle.
    pub(crate) iovecs: Box<[IovecSlot]>,

    /// Opaque 64-bit per-segment payloads, parallel to `iovecs`.
    pub(crate) iovec_data: Box<[AtomicU64]>,

    /// Page-sized scratch regions, `io_bounce_buffers` per backend.
    pub(crate) bounce: Box<[BounceBufferSlot]>,

    /// Subject table; index 0 is the invalid subject.
    pub(crate) subjects: Vec<AioSubjectInfo>,

    /// Shared completion callback table.
    pub(crate) shared_cbs: Vec<AioSharedCallbacks>,

    /// Combine limit captured at initialization time.
    pub(crate) io_combine_limit: usize,

    pub(crate) io_handles_per_backend: usize,
    pub(crate) bounce_per_backend: usize,
    pub(crate) num_backends: usize,
    pub(crate) method: IoMethodKind,

    /// One flag per backend slot, so a procno cannot be attached twice.
    attached: Box<[AtomicBool]>,
}

impl AioControl {
    /// Allocate and initialize the control block.
    ///
    /// Sizing comes from the configuration: `io_max_concurrency` handles and
    /// `io_bounce_buffers` scratch pages per backend, `io_combine_limit`
    /// iovec slots per handle. The callback registry must be built
    /// identically in every process that attaches.
    pub fn initialize(
        config: &AioConfig,
        num_backends: usize,
        registry: AioCallbackRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if num_backends == 0 {
            return Err(AioError::Configuration(
                "process group needs at least one backend".to_string(),
            ));
        }

        let per_backend = config.io_max_concurrency;
        let combine_limit = config.io_combine_limit;
        let handle_count = per_backend * num_backends;
        let iovec_count = handle_count * combine_limit;
        let bounce_per_backend = config.io_bounce_buffers;
        let bounce_count = bounce_per_backend * num_backends;

        let handles: Box<[AioHandleSlot]> = (0..handle_count)
            .map(|i| {
                let owner = (i / per_backend) as ProcNumber;
                AioHandleSlot::new(owner, (i * combine_limit) as u32)
            })
            .collect();

        let iovecs: Box<[IovecSlot]> = (0..iovec_count).map(|_| IovecSlot::new()).collect();
        let iovec_data: Box<[AtomicU64]> =
            (0..iovec_count).map(|_| AtomicU64::new(0)).collect();
        let bounce: Box<[BounceBufferSlot]> = (0..bounce_count)
            .map(|_| BounceBufferSlot::new())
            .collect::<Result<_>>()?;

        let (subjects, shared_cbs) = registry.into_tables();

        tracing::debug!(
            handles = handle_count,
            iovecs = iovec_count,
            bounce_buffers = bounce_count,
            "initialized AIO control block"
        );

        Ok(Arc::new(Self {
            handles,
            iovecs,
            iovec_data,
            bounce,
            subjects,
            shared_cbs,
            io_combine_limit: combine_limit,
            io_handles_per_backend: per_backend,
            bounce_per_backend,
            num_backends,
            method: config.io_method,
            attached: (0..num_backends).map(|_| AtomicBool::new(false)).collect(),
        }))
    }

    /// Attach the calling process as backend `procno`, producing its
    /// per-backend view. Each backend slot may be attached exactly once.
    pub fn attach(self: &Arc<Self>, procno: ProcNumber) -> Result<AioBackend> {
        if procno < 0 || procno as usize >= self.num_backends {
            return Err(AioError::InvalidArgument(format!(
                "backend {} out of range (group has {})",
                procno, self.num_backends
            )));
        }
        if self.attached[procno as usize].swap(true, Ordering::AcqRel) {
            return Err(AioError::InvalidArgument(format!(
                "backend {} is already attached",
                procno
            )));
        }

        let io_handle_off = procno as usize * self.io_handles_per_backend;
        let bounce_off = procno as usize * self.bounce_per_backend;

        Ok(AioBackend {
            ctl: Arc::clone(self),
            procno,
            io_handle_off,
            bounce_off,
            idle_ios: (io_handle_off..io_handle_off + self.io_handles_per_backend).collect(),
            idle_bbs: (bounce_off..bounce_off + self.bounce_per_backend).collect(),
            staged_ios: Vec::with_capacity(SUBMIT_BATCH_SIZE),
            handed_out_io: None,
            handed_out_bb: None,
            local: (0..self.io_handles_per_backend)
                .map(|_| HandleLocal::default())
                .collect(),
            bounce_owner: vec![None; self.bounce_per_backend].into_boxed_slice(),
            owners: OwnerArena::new(),
            free_scan_pos: 0,
            bb_scan_pos: 0,
            crit_depth: 0,
            stats: AioBackendStats::default(),
        })
    }

    /// Total number of handle slots in the pool.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// The combine limit captured at initialization.
    pub fn io_combine_limit(&self) -> usize {
        self.io_combine_limit
    }
}

// ============================================================================
// Per-Backend View
// ============================================================================

/// Issuer-local per-handle bookkeeping. Only the owning backend touches
/// these, so they stay out of the shared slot.
#[derive(Default)]
pub(crate) struct HandleLocal {
    pub(crate) resowner: Option<OwnerId>,
    pub(crate) report: Option<AioReturnRef>,
    pub(crate) bounce: Vec<usize>,
}

/// Per-backend counters, in the spirit of the other engine stats structs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AioBackendStats {
    /// Handles submitted through the staged batch
    pub submissions: u64,

    /// Completions processed by this backend (own or reaped for others)
    pub completions: u64,

    /// Handles reclaimed to the idle list
    pub reclaims: u64,

    /// Syscalls that returned a negative result
    pub syscall_failures: u64,

    /// Staged batches flushed
    pub batches: u64,
}

/// One backend process's private view of the AIO subsystem.
pub struct AioBackend {
    pub(crate) ctl: Arc<AioControl>,
    pub(crate) procno: ProcNumber,

    /// First index of this backend's handle range.
    pub(crate) io_handle_off: usize,
    pub(crate) bounce_off: usize,

    /// Handles in `IDLE`, owned by this backend (I3).
    pub(crate) idle_ios: VecDeque<usize>,

    /// Free bounce buffers.
    pub(crate) idle_bbs: Vec<usize>,

    /// Prepared handles awaiting submission, FIFO.
    pub(crate) staged_ios: Vec<usize>,

    /// The at-most-one handle between acquire and prepare (I4).
    pub(crate) handed_out_io: Option<usize>,
    pub(crate) handed_out_bb: Option<usize>,

    pub(crate) local: Box<[HandleLocal]>,
    pub(crate) bounce_owner: Box<[Option<OwnerId>]>,
    pub(crate) owners: OwnerArena,

    /// Round-robin cursors for the wait-for-free scans.
    pub(crate) free_scan_pos: usize,
    pub(crate) bb_scan_pos: usize,

    pub(crate) crit_depth: u32,
    pub(crate) stats: AioBackendStats,
}

impl AioBackend {
    /// Identity of this backend within the process group.
    pub fn procno(&self) -> ProcNumber {
        self.procno
    }

    /// Backend counters.
    pub fn stats(&self) -> AioBackendStats {
        self.stats
    }

    /// Whether a submission batch is pending.
    pub fn have_staged(&self) -> bool {
        !self.staged_ios.is_empty()
    }

    /// Enter a critical section: handle acquisition stays legal, but
    /// suspension points must not be reached.
    pub fn begin_critical_section(&mut self) {
        self.crit_depth += 1;
    }

    /// Leave the innermost critical section.
    pub fn end_critical_section(&mut self) {
        debug_assert!(self.crit_depth > 0);
        self.crit_depth -= 1;
    }

    /// Transaction-end hook: no handle or bounce buffer may still be
    /// handed out once every resource owner has been released.
    pub fn at_xact_end(&mut self, _is_subxact: bool, _is_commit: bool) {
        debug_assert!(self.handed_out_io.is_none());
        debug_assert!(self.handed_out_bb.is_none());
    }

    /// Like `at_xact_end` for errors raised outside any transaction.
    pub fn at_error(&mut self) {
        debug_assert!(self.handed_out_io.is_none());
        debug_assert!(self.handed_out_bb.is_none());
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &AioHandleSlot {
        &self.ctl.handles[idx]
    }

    #[inline]
    pub(crate) fn is_mine(&self, idx: usize) -> bool {
        idx >= self.io_handle_off && idx < self.io_handle_off + self.ctl.io_handles_per_backend
    }

    #[inline]
    pub(crate) fn local(&self, idx: usize) -> &HandleLocal {
        debug_assert!(self.is_mine(idx));
        &self.local[idx - self.io_handle_off]
    }

    #[inline]
    pub(crate) fn local_mut(&mut self, idx: usize) -> &mut HandleLocal {
        debug_assert!(self.is_mine(idx));
        &mut self.local[idx - self.io_handle_off]
    }
}
