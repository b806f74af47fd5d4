// # Bounce Buffers
//
// Page-sized scratch regions for I/O that cannot target the user's buffer
// directly (checksum computation on write, direct I/O alignment). They
// follow the same hand-out discipline as handles: at most one outstanding
// per backend between acquisition and association, and once associated
// with a handle, ownership transfers to the handle and the buffers come
// back to the backend's free list when the handle is reclaimed.

use crate::aio::control::AioBackend;
use crate::aio::handle::{AioHandleRef, HandleState};
use crate::aio::{AioHandle, OwnerId};
use crate::common::BLOCK_SIZE;
use crate::error::{AioError, Result};
use crate::trap;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr;
use std::sync::Arc;

// ============================================================================
// Bounce Buffer Slot
// ============================================================================

/// One page-sized, page-aligned scratch region in the shared pool.
pub(crate) struct BounceBufferSlot {
    ptr: *mut u8,
    layout: Layout,
}

impl BounceBufferSlot {
    pub(crate) fn new() -> Result<Self> {
        let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE)
            .map_err(|_| AioError::Configuration("invalid bounce buffer layout".to_string()))?;

        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(AioError::ResourceExhausted(
                "bounce buffer allocation failed".to_string(),
            ));
        }

        unsafe {
            ptr::write_bytes(ptr, 0, BLOCK_SIZE);
        }

        Ok(Self { ptr, layout })
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for BounceBufferSlot {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

// Safety: the region is only ever written through while handed out to one
// backend or associated with one in-flight handle; the hand-out discipline
// gives it a single writer at any time.
unsafe impl Send for BounceBufferSlot {}
unsafe impl Sync for BounceBufferSlot {}

/// Token for an acquired bounce buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceBuffer {
    pub(crate) idx: usize,
}

// ============================================================================
// Acquisition & Association
// ============================================================================

impl AioBackend {
    /// Acquire a bounce buffer, blocking until one is free. At most one may
    /// be outstanding per backend until it is associated or released.
    pub fn bounce_buffer_get(&mut self, resowner: Option<OwnerId>) -> BounceBuffer {
        if self.handed_out_bb.is_some() {
            trap!("can only hand out one bounce buffer");
        }

        if self.idle_bbs.is_empty() {
            self.bounce_buffer_wait_for_free();
        }

        let idx = match self.idle_bbs.pop() {
            Some(idx) => idx,
            None => trap!("no bounce buffer after successful wait"),
        };
        self.handed_out_bb = Some(idx);

        if let Some(owner) = resowner {
            self.bounce_owner[idx - self.bounce_off] = Some(owner);
            self.owners.remember_bb(owner, idx);
        }

        BounceBuffer { idx }
    }

    /// Transfer the handed-out bounce buffer to a handle. Vectored I/Os may
    /// associate several buffers with one handle; they all return to the
    /// free list when the handle is reclaimed.
    pub fn io_assoc_bounce_buffer(&mut self, h: AioHandle, bb: BounceBuffer) {
        if self.handed_out_bb != Some(bb.idx) {
            trap!("can only associate the handed out bounce buffer");
        }
        self.handed_out_bb = None;

        if let Some(owner) = self.bounce_owner[bb.idx - self.bounce_off].take() {
            self.owners.forget_bb(owner, bb.idx);
        }

        self.local_mut(h.idx).bounce.push(bb.idx);
    }

    /// Return the handed-out bounce buffer without associating it.
    pub fn bounce_buffer_release(&mut self, bb: BounceBuffer) {
        if self.handed_out_bb != Some(bb.idx) {
            trap!("can only release the handed out bounce buffer");
        }

        if let Some(owner) = self.bounce_owner[bb.idx - self.bounce_off].take() {
            self.owners.forget_bb(owner, bb.idx);
        }

        self.idle_bbs.push(bb.idx);
        self.handed_out_bb = None;
    }

    /// Forcibly release a bounce buffer during resource-owner cleanup.
    pub(crate) fn bounce_buffer_release_resowner(&mut self, idx: usize, on_error: bool) {
        if !on_error {
            tracing::warn!(bb = idx, "leaked AIO bounce buffer");
        }

        self.bounce_owner[idx - self.bounce_off] = None;
        if self.handed_out_bb == Some(idx) {
            self.handed_out_bb = None;
        }
        self.idle_bbs.push(idx);
    }

    /// Index of the bounce buffer in the shared pool.
    pub fn bounce_buffer_id(&self, bb: BounceBuffer) -> usize {
        bb.idx
    }

    /// Raw pointer to the page-sized region, for building iovecs.
    pub fn bounce_buffer_ptr(&self, bb: BounceBuffer) -> *mut u8 {
        self.ctl.bounce[bb.idx].ptr()
    }

    /// Byte access to the region while this backend controls it.
    pub fn bounce_buffer_mut(&mut self, bb: BounceBuffer) -> &mut [u8] {
        debug_assert!(
            bb.idx >= self.bounce_off && bb.idx < self.bounce_off + self.ctl.bounce_per_backend
        );
        unsafe { std::slice::from_raw_parts_mut(self.ctl.bounce[bb.idx].ptr(), BLOCK_SIZE) }
    }

    /// Wait for a bounce buffer to come free by waiting on this backend's
    /// handles that hold them, reclaiming completed handles along the way.
    fn bounce_buffer_wait_for_free(&mut self) {
        let ctl = Arc::clone(&self.ctl);
        let per_backend = ctl.io_handles_per_backend;

        if !self.staged_ios.is_empty() {
            tracing::debug!("submitting staged IOs while acquiring a bounce buffer");
            self.submit_staged();
        }

        let start = self.bb_scan_pos;
        for i in start..start + per_backend {
            let idx = self.io_handle_off + (i % per_backend);
            let slot = &ctl.handles[idx];

            match slot.state() {
                HandleState::Idle | HandleState::HandedOut => continue,
                HandleState::Defined | HandleState::Prepared => {
                    trap!(
                        "io:{} in state {} while waiting for a bounce buffer",
                        idx,
                        slot.state().name()
                    );
                }
                HandleState::Reaped | HandleState::InFlight => {
                    if self.local(idx).bounce.is_empty() {
                        continue;
                    }

                    let ior = AioHandleRef::from_slot(idx, slot.generation());
                    self.io_ref_wait(&ior);
                    tracing::debug!(io = idx, "waited for io to reclaim bounce buffers");

                    if self.idle_bbs.is_empty() {
                        tracing::warn!("no bounce buffers after wait");
                    }
                    if !self.idle_bbs.is_empty() {
                        self.bb_scan_pos = i % per_backend;
                        return;
                    }
                }
                HandleState::CompletedShared | HandleState::CompletedLocal => {
                    self.io_reclaim(idx);

                    if !self.idle_bbs.is_empty() {
                        self.bb_scan_pos = i % per_backend;
                        return;
                    }
                }
            }
        }

        // The submission above could have completed IOs at any point.
        if self.idle_bbs.is_empty() {
            trap!("no more bounce buffers");
        }
    }
}
