// # Handle Pool & State Machine
//
// The handle is the unit of work of the AIO core: a reusable shared-memory
// record describing one I/O in preparation or in flight. Handles advance
// through the eight-state lifecycle, are owned by exactly one backend
// between acquire and reclaim, and carry a generation counter so that a
// copied reference can detect that its slot has been recycled.
//
// Cross-process publication follows the barrier contract: a state that
// other processes may observe is stored with Release ordering, and readers
// load it with Acquire before dereferencing the other fields. The
// generation bump on reclaim is ordered before the transition to IDLE, so
// a stale reference can never observe both its old generation and the new
// IDLE state.

use crate::aio::subject::AioResult;
use crate::aio::{AioReturnRef, OwnerId, AIO_MAX_SHARED_CALLBACKS, SUBMIT_BATCH_SIZE};
use crate::common::ProcNumber;
use crate::trap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::control::AioBackend;

// ============================================================================
// Handle State
// ============================================================================

/// Lifecycle state of an AIO handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// Free, on the owning backend's idle list
    Idle = 0,
    /// Acquired by the owner, not yet defined
    HandedOut = 1,
    /// Operation fixed, subject prepare callbacks not yet run
    Defined = 2,
    /// Ready for submission
    Prepared = 3,
    /// Submitted to the I/O method
    InFlight = 4,
    /// Syscall result recorded, shared callbacks running
    Reaped = 5,
    /// Shared callbacks finished; result visible to every process
    CompletedShared = 6,
    /// Owner is delivering the result locally
    CompletedLocal = 7,
}

impl From<u8> for HandleState {
    fn from(v: u8) -> Self {
        match v {
            0 => HandleState::Idle,
            1 => HandleState::HandedOut,
            2 => HandleState::Defined,
            3 => HandleState::Prepared,
            4 => HandleState::InFlight,
            5 => HandleState::Reaped,
            6 => HandleState::CompletedShared,
            7 => HandleState::CompletedLocal,
            _ => HandleState::Idle,
        }
    }
}

impl HandleState {
    /// Human-readable name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            HandleState::Idle => "idle",
            HandleState::HandedOut => "handed_out",
            HandleState::Defined => "defined",
            HandleState::Prepared => "prepared",
            HandleState::InFlight => "in_flight",
            HandleState::Reaped => "reaped",
            HandleState::CompletedShared => "completed_shared",
            HandleState::CompletedLocal => "completed_local",
        }
    }
}

// ============================================================================
// Handle Slot
// ============================================================================

/// One handle in the shared pool.
///
/// Fields written by the owner before a publishing state transition are
/// plain relaxed atomics; the Release store on `state` orders them for any
/// process that loads the state with Acquire.
pub(crate) struct AioHandleSlot {
    state: AtomicU8,
    generation: AtomicU64,

    /// Fixed at initialization; handles never migrate between backends.
    owner_procno: ProcNumber,

    /// First slot of this handle's window in the shared iovec pools.
    pub(crate) iovec_off: u32,

    /// Raw signed syscall return; negative errno on failure.
    pub(crate) result: AtomicI64,

    /// Packed [`AioResult`] produced by the shared completion callbacks.
    pub(crate) distilled: AtomicU64,

    pub(crate) op: AtomicU8,
    pub(crate) subject: AtomicU8,
    pub(crate) flags: AtomicU8,
    pub(crate) num_shared_callbacks: AtomicU8,
    pub(crate) shared_callbacks: [AtomicU8; AIO_MAX_SHARED_CALLBACKS],

    /// Opaque per-subject payload delivered to callbacks.
    pub(crate) scb_data: AtomicU64,

    pub(crate) iovec_data_len: AtomicU8,

    pub(crate) op_fd: AtomicI32,
    pub(crate) op_offset: AtomicU64,
    pub(crate) op_iov_length: AtomicU32,

    /// Completion wake-ups for cross-process waiters.
    cv_lock: Mutex<()>,
    cv: Condvar,
}

impl AioHandleSlot {
    pub(crate) fn new(owner_procno: ProcNumber, iovec_off: u32) -> Self {
        Self {
            state: AtomicU8::new(HandleState::Idle as u8),
            // Generation zero is reserved so cleared references never match.
            generation: AtomicU64::new(1),
            owner_procno,
            iovec_off,
            result: AtomicI64::new(0),
            distilled: AtomicU64::new(0),
            op: AtomicU8::new(0),
            subject: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            num_shared_callbacks: AtomicU8::new(0),
            shared_callbacks: Default::default(),
            scb_data: AtomicU64::new(0),
            iovec_data_len: AtomicU8::new(0),
            op_fd: AtomicI32::new(-1),
            op_offset: AtomicU64::new(0),
            op_iov_length: AtomicU32::new(0),
            cv_lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> HandleState {
        HandleState::from(self.state.load(Ordering::Acquire))
    }

    /// Central state transition: publish with a Release store so every
    /// field written before the transition is visible to a process that
    /// observes the new state.
    #[inline]
    pub(crate) fn publish_state(&self, to: HandleState) {
        self.state.store(to as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn owner_procno(&self) -> ProcNumber {
        self.owner_procno
    }

    /// Read the current state and compare the generation against a
    /// reference's expectation. A mismatch means the slot was reclaimed and
    /// now belongs to some other I/O: "any state, not mine".
    #[inline]
    pub(crate) fn was_recycled(&self, ref_generation: u64) -> (bool, HandleState) {
        let state = self.state();
        let recycled = self.generation() != ref_generation;
        (recycled, state)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Release) + 1
    }

    /// Wake every waiter on this handle. The lock acquisition pairs with
    /// the waiters' re-check under the same lock, closing the window where
    /// a state change could race a sleeper into missing its wakeup.
    pub(crate) fn wake_all(&self) {
        drop(self.cv_lock.lock());
        self.cv.notify_all();
    }

    fn sleep_while_pending(&self, ref_generation: u64) {
        let mut guard = self.cv_lock.lock();
        loop {
            let (recycled, state) = self.was_recycled(ref_generation);
            if recycled
                || !matches!(
                    state,
                    HandleState::Defined
                        | HandleState::Prepared
                        | HandleState::InFlight
                        | HandleState::Reaped
                )
            {
                break;
            }
            self.cv.wait(&mut guard);
        }
    }
}

// ============================================================================
// Handle Tokens & References
// ============================================================================

/// Token for an acquired handle, valid on the owning backend between
/// acquisition and reclaim. Copyable so that prepare helpers can pass it
/// around freely; every operation re-checks the slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioHandle {
    pub(crate) idx: usize,
}

/// Weak reference to a handle: the slot index plus the generation the
/// reference was taken at, split into two 32-bit halves so the whole value
/// stays a plain copyable 96 bits. A reference never owns its target and
/// may outlive it arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioHandleRef {
    aio_index: u32,
    generation_upper: u32,
    generation_lower: u32,
}

impl AioHandleRef {
    pub(crate) fn from_slot(idx: usize, generation: u64) -> Self {
        Self {
            aio_index: idx as u32,
            generation_upper: (generation >> 32) as u32,
            generation_lower: generation as u32,
        }
    }

    /// A reference that points at no handle.
    pub const fn cleared() -> Self {
        Self {
            aio_index: u32::MAX,
            generation_upper: 0,
            generation_lower: 0,
        }
    }

    /// Reset the reference to point at no handle.
    pub fn clear(&mut self) {
        self.aio_index = u32::MAX;
    }

    /// Whether the reference points at a handle slot at all. Does not say
    /// anything about recycling; waiting on a recycled reference is a no-op.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.aio_index != u32::MAX
    }

    /// Index of the referenced handle slot.
    pub fn index(&self) -> usize {
        debug_assert!(self.is_valid());
        self.aio_index as usize
    }

    /// Reconstruct the 64-bit generation the reference was taken at.
    pub fn generation(&self) -> u64 {
        ((self.generation_upper as u64) << 32) | self.generation_lower as u64
    }
}

// ============================================================================
// Acquisition & Release
// ============================================================================

impl AioBackend {
    /// Acquire an idle handle, blocking until one can be reclaimed.
    ///
    /// If a resource owner is given, the handle is registered with it and
    /// will be cleaned up when the owner is released. If a return slot is
    /// given, the distilled result is delivered there on reclaim.
    pub fn io_get(&mut self, resowner: Option<OwnerId>, report: Option<AioReturnRef>) -> AioHandle {
        loop {
            if let Some(h) = self.io_get_nb(resowner, report.clone()) {
                return h;
            }

            // All handles of this backend are in use; wait for completions.
            self.wait_for_free();
        }
    }

    /// Non-blocking variant of [`Self::io_get`].
    pub fn io_get_nb(
        &mut self,
        resowner: Option<OwnerId>,
        report: Option<AioReturnRef>,
    ) -> Option<AioHandle> {
        if self.staged_ios.len() >= SUBMIT_BATCH_SIZE {
            debug_assert_eq!(self.staged_ios.len(), SUBMIT_BATCH_SIZE);
            self.submit_staged();
        }

        if self.handed_out_io.is_some() {
            trap!("API violation: only one IO can be handed out");
        }

        let ctl = Arc::clone(&self.ctl);
        let idx = self.idle_ios.pop_front()?;
        let slot = &ctl.handles[idx];

        debug_assert_eq!(slot.state(), HandleState::Idle);
        debug_assert_eq!(slot.owner_procno(), self.procno);

        slot.publish_state(HandleState::HandedOut);
        self.handed_out_io = Some(idx);

        if let Some(owner) = resowner {
            self.resowner_register_io(idx, owner);
        }
        if report.is_some() {
            self.local_mut(idx).report = report;
        }

        Some(AioHandle { idx })
    }

    /// Return a handed-out handle without ever defining an operation.
    pub fn io_release(&mut self, h: AioHandle) {
        if self.handed_out_io == Some(h.idx) {
            debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);

            self.handed_out_io = None;
            self.io_reclaim(h.idx);
        } else {
            trap!("release of io:{} in unexpected state", h.idx);
        }
    }

    /// Take a weak reference to a handle for later waiting. Only meaningful
    /// between acquisition and submission; the reference stays safe to use
    /// (and to outlive the I/O) afterwards.
    pub fn io_ref(&self, h: AioHandle) -> AioHandleRef {
        let slot = self.slot(h.idx);
        debug_assert!(matches!(
            slot.state(),
            HandleState::HandedOut | HandleState::Defined | HandleState::Prepared
        ));
        let generation = slot.generation();
        debug_assert_ne!(generation, 0);
        AioHandleRef::from_slot(h.idx, generation)
    }

    /// Index of the handle in the shared pool.
    pub fn io_id(&self, h: AioHandle) -> usize {
        h.idx
    }

    /// Owning backend of the handle.
    pub fn io_owner(&self, h: AioHandle) -> ProcNumber {
        self.slot(h.idx).owner_procno()
    }

    /// Set a handle flag; only legal while the handle is handed out.
    pub fn io_set_flag(&mut self, h: AioHandle, flag: u8) {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);
        self.slot(h.idx).flags.fetch_or(flag, Ordering::Relaxed);
    }

    /// Current handle flags.
    pub fn io_flags(&self, h: AioHandle) -> u8 {
        self.slot(h.idx).flags.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------------

    /// Return a handle to the idle list, delivering the distilled result to
    /// the issuer's return slot and releasing everything attached to it.
    /// Only the owner may reclaim; reclaiming an already idle handle is a
    /// diagnosed no-op.
    pub(crate) fn io_reclaim(&mut self, idx: usize) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[idx];

        if slot.owner_procno() != self.procno {
            trap!(
                "cannot reclaim io:{} owned by backend {}",
                idx,
                slot.owner_procno()
            );
        }

        let state = slot.state();
        if state == HandleState::Idle {
            tracing::warn!(io = idx, "reclaim of already idle handle");
            return;
        }

        tracing::debug!(
            io = idx,
            state = state.name(),
            result = slot.result.load(Ordering::Relaxed),
            "reclaiming"
        );

        // Everybody else is done with this IO; deliver the result locally.
        if state == HandleState::CompletedShared {
            slot.publish_state(HandleState::CompletedLocal);
        }

        if let Some(report) = self.local_mut(idx).report.take() {
            if state != HandleState::HandedOut {
                let mut ret = report.lock();
                ret.result = AioResult::from_bits(slot.distilled.load(Ordering::Acquire));
                ret.subject_data = slot.scb_data.load(Ordering::Relaxed);
            }
        }

        // Associated bounce buffers go back to the backend's free list.
        let bounce = std::mem::take(&mut self.local_mut(idx).bounce);
        self.idle_bbs.extend(bounce);

        if let Some(owner) = self.local_mut(idx).resowner.take() {
            self.owners.forget_io(owner, idx);
        }

        slot.num_shared_callbacks.store(0, Ordering::Relaxed);
        slot.iovec_data_len.store(0, Ordering::Relaxed);
        slot.flags.store(0, Ordering::Relaxed);

        // Bump the generation before publishing IDLE so a stale reference
        // can never see its own generation alongside the new state.
        slot.bump_generation();
        slot.publish_state(HandleState::Idle);

        self.stats.reclaims += 1;
        self.idle_ios.push_back(idx);
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    fn ref_resolve(&self, ior: &AioHandleRef) -> (usize, u64) {
        if !ior.is_valid() || ior.index() >= self.ctl.handles.len() {
            trap!("wait on invalid AIO handle reference");
        }
        let generation = ior.generation();
        debug_assert_ne!(generation, 0);
        (ior.index(), generation)
    }

    /// Wait until the referenced I/O has completed or its handle was
    /// recycled. The owner flushes its staged batch first so the wait
    /// cannot deadlock on an unsubmitted I/O.
    pub fn io_ref_wait(&mut self, ior: &AioHandleRef) {
        let ctl = Arc::clone(&self.ctl);
        let (idx, ref_generation) = self.ref_resolve(ior);
        let slot = &ctl.handles[idx];
        let am_owner = slot.owner_procno() == self.procno;

        let (recycled, state) = slot.was_recycled(ref_generation);
        if recycled {
            return;
        }

        if am_owner {
            if state == HandleState::Defined || state == HandleState::Prepared {
                self.submit_staged();
            } else if !matches!(
                state,
                HandleState::InFlight
                    | HandleState::Reaped
                    | HandleState::CompletedShared
                    | HandleState::CompletedLocal
            ) {
                trap!("waiting for own IO in wrong state: {}", state.name());
            }

            // Somebody else completed the IO; deliver the result eagerly.
            if state == HandleState::CompletedLocal {
                self.io_reclaim(idx);
                return;
            }
        }

        loop {
            let (recycled, state) = slot.was_recycled(ref_generation);
            if recycled {
                return;
            }

            match state {
                HandleState::Idle | HandleState::HandedOut => {
                    trap!("IO in wrong state: {}", state.name());
                }

                HandleState::InFlight if self.method_wait_one(idx, ref_generation) => {
                    continue;
                }

                HandleState::Defined
                | HandleState::Prepared
                | HandleState::InFlight
                | HandleState::Reaped => {
                    slot.sleep_while_pending(ref_generation);
                }

                HandleState::CompletedShared => {
                    if am_owner {
                        self.io_reclaim(idx);
                    }
                    return;
                }

                HandleState::CompletedLocal => return,
            }
        }
    }

    /// Non-blocking completion probe. Reclaims eagerly when the caller owns
    /// a completed handle.
    pub fn io_ref_check_done(&mut self, ior: &AioHandleRef) -> bool {
        let ctl = Arc::clone(&self.ctl);
        let (idx, ref_generation) = self.ref_resolve(ior);
        let slot = &ctl.handles[idx];

        let (recycled, state) = slot.was_recycled(ref_generation);
        if recycled || state == HandleState::Idle {
            return true;
        }

        if state == HandleState::CompletedShared || state == HandleState::CompletedLocal {
            if slot.owner_procno() == self.procno {
                self.io_reclaim(idx);
            }
            return true;
        }

        false
    }

    /// Block until at least one of this backend's handles can be acquired.
    ///
    /// Fast path: reclaim any of our handles that already completed. Slow
    /// path: flush the staged batch, then round-robin from the remembered
    /// cursor and wait on the first handle that is still moving.
    pub(crate) fn wait_for_free(&mut self) {
        let ctl = Arc::clone(&self.ctl);
        let per_backend = ctl.io_handles_per_backend;

        tracing::debug!(
            staged = self.staged_ios.len(),
            "waiting for a free AIO handle"
        );

        let mut reclaimed = 0;
        for i in 0..per_backend {
            let idx = self.io_handle_off + i;
            if ctl.handles[idx].state() == HandleState::CompletedShared {
                self.io_reclaim(idx);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            return;
        }

        if !self.staged_ios.is_empty() {
            tracing::debug!("submitting staged IOs while acquiring a free handle");
            self.submit_staged();
        }

        let mut found_handed_out = false;
        let start = self.free_scan_pos;
        for i in start..start + per_backend {
            let idx = self.io_handle_off + (i % per_backend);
            let slot = &ctl.handles[idx];

            match slot.state() {
                HandleState::Idle => {
                    // The IO completed during the submission above.
                    return;
                }
                HandleState::Defined | HandleState::Prepared | HandleState::CompletedLocal => {
                    trap!(
                        "io:{} in state {} while waiting for a free handle",
                        idx,
                        slot.state().name()
                    );
                }
                HandleState::HandedOut => {
                    if found_handed_out {
                        trap!("more than one handed out IO");
                    }
                    found_handed_out = true;
                }
                HandleState::Reaped | HandleState::InFlight => {
                    let ior = AioHandleRef::from_slot(idx, slot.generation());
                    self.io_ref_wait(&ior);
                    tracing::debug!(io = idx, "waited for io");
                    self.free_scan_pos = i % per_backend;
                    return;
                }
                HandleState::CompletedShared => {
                    self.io_reclaim(idx);
                    self.free_scan_pos = i % per_backend;
                    return;
                }
            }
        }

        trap!("could not reclaim any AIO handles");
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Transition a prepared handle to IN_FLIGHT on behalf of the method.
    pub(crate) fn io_prepare_submit(&mut self, idx: usize) {
        self.slot(idx).publish_state(HandleState::InFlight);
    }

    /// Drive a handle from IN_FLIGHT to COMPLETED_SHARED: record the raw
    /// syscall result, run the shared completion callbacks, publish, and
    /// wake every waiter. Runs in whatever process observed the completion,
    /// which is not necessarily the issuer.
    pub(crate) fn io_process_completion(&mut self, idx: usize, result: i64) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[idx];

        debug_assert_eq!(slot.state(), HandleState::InFlight);

        slot.result.store(result, Ordering::Relaxed);
        slot.publish_state(HandleState::Reaped);

        self.process_completion_subject(idx);

        // Results of the callbacks must be visible before the new state.
        slot.publish_state(HandleState::CompletedShared);

        slot.wake_all();
        self.stats.completions += 1;
        if result < 0 {
            self.stats.syscall_failures += 1;
        }

        if slot.owner_procno() == self.procno {
            self.io_reclaim(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::{AioCallbackRegistry, AioControl};
    use crate::config::AioConfig;

    fn small_backend() -> AioBackend {
        let config = AioConfig {
            io_max_concurrency: 4,
            io_bounce_buffers: 2,
            ..Default::default()
        };
        AioControl::initialize(&config, 1, AioCallbackRegistry::new())
            .unwrap()
            .attach(0)
            .unwrap()
    }

    #[test]
    fn test_state_roundtrip() {
        for v in 0..8u8 {
            assert_eq!(HandleState::from(v) as u8, v);
        }
        assert_eq!(HandleState::CompletedShared.name(), "completed_shared");
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut backend = small_backend();

        let h = backend.io_get_nb(None, None).unwrap();
        assert_eq!(backend.slot(h.idx).state(), HandleState::HandedOut);

        backend.io_release(h);
        assert_eq!(backend.slot(h.idx).state(), HandleState::Idle);
        assert_eq!(backend.idle_ios.len(), 4);
    }

    #[test]
    fn test_generation_monotonic_across_reclaim() {
        let mut backend = small_backend();

        let h = backend.io_get_nb(None, None).unwrap();
        let before = backend.slot(h.idx).generation();
        backend.io_release(h);
        let after = backend.slot(h.idx).generation();

        assert!(after > before);
        assert_ne!(before, 0);
        assert_ne!(after, 0);
    }

    #[test]
    #[should_panic(expected = "only one IO")]
    fn test_double_acquire_traps() {
        let mut backend = small_backend();
        let _h = backend.io_get_nb(None, None).unwrap();
        let _ = backend.io_get_nb(None, None);
    }

    #[test]
    #[should_panic(expected = "release of io")]
    fn test_release_unacquired_traps() {
        let mut backend = small_backend();
        backend.io_release(AioHandle { idx: 0 });
    }

    #[test]
    fn test_recycled_reference_detected() {
        let mut backend = small_backend();

        let h = backend.io_get_nb(None, None).unwrap();
        let ior = backend.io_ref(h);
        backend.io_release(h);

        let (recycled, _) = backend.slot(ior.index()).was_recycled(ior.generation());
        assert!(recycled);

        // Waiting on a recycled reference is a no-op.
        backend.io_ref_wait(&ior);
        assert!(backend.io_ref_check_done(&ior));
    }

    #[test]
    fn test_cleared_reference() {
        let mut ior = AioHandleRef::cleared();
        assert!(!ior.is_valid());
        ior = AioHandleRef::from_slot(3, 0x1_0000_0002);
        assert!(ior.is_valid());
        assert_eq!(ior.index(), 3);
        assert_eq!(ior.generation(), 0x1_0000_0002);
        ior.clear();
        assert!(!ior.is_valid());
    }

    // One backend issues and submits; another observes IN_FLIGHT, reaps
    // the completion, runs the shared callbacks, and publishes. The owner,
    // waiting on its reference, wakes up and delivers the result.
    #[test]
    fn test_completion_reaped_by_other_backend() {
        use crate::aio::{new_return, AioResultStatus};

        let config = AioConfig {
            io_max_concurrency: 4,
            ..Default::default()
        };
        let ctl = AioControl::initialize(&config, 2, AioCallbackRegistry::new()).unwrap();
        let mut owner = ctl.attach(0).unwrap();
        let mut reaper = ctl.attach(1).unwrap();

        let ret = new_return();
        let h = owner.io_get_nb(None, Some(ret.clone())).unwrap();
        let idx = h.idx;

        // Drive the handle to IN_FLIGHT without executing anything, as a
        // kernel-submitting method would.
        owner.slot(idx).publish_state(HandleState::Defined);
        owner.handed_out_io = None;
        owner.slot(idx).publish_state(HandleState::Prepared);
        let ior = AioHandleRef::from_slot(idx, owner.slot(idx).generation());
        owner.io_prepare_submit(idx);

        let reaper_thread = std::thread::spawn(move || {
            reaper.io_process_completion(idx, 42);
            reaper
        });
        let reaper = reaper_thread.join().unwrap();
        assert_eq!(reaper.stats().completions, 1);

        // The reaper is not the owner, so the handle stays COMPLETED_SHARED
        // until the owner picks it up.
        assert_eq!(owner.slot(idx).state(), HandleState::CompletedShared);

        owner.io_ref_wait(&ior);
        assert_eq!(owner.slot(idx).state(), HandleState::Idle);
        assert_eq!(ret.lock().result.status, AioResultStatus::Ok);
        assert_eq!(ret.lock().result.result, 42);
    }

    #[test]
    fn test_double_reclaim_is_noop() {
        let mut backend = small_backend();

        let h = backend.io_get_nb(None, None).unwrap();
        let idx = h.idx;
        backend.io_release(h);
        let generation = backend.slot(idx).generation();

        // Second reclaim on the same generation must not corrupt the pool.
        backend.io_reclaim(idx);
        assert_eq!(backend.slot(idx).generation(), generation);
        assert_eq!(backend.idle_ios.len(), 4);
    }
}
