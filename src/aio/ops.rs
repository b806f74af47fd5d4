// # Operation Dispatch
//
// Fixing the operation of a handed-out handle and executing it. Vectored
// reads and writes carry their segments in the handle's iovec window in the
// shared control block; the executing process, which may not be the issuer,
// rebuilds the `libc::iovec` array from those slots.
//
// Preparation runs the subject's prepare callbacks in reverse registration
// order, then either stages the handle for batched submission or, when the
// handle must complete in the issuing process, performs the syscall on the
// spot and drives completion.

use crate::aio::control::AioBackend;
use crate::aio::handle::HandleState;
use crate::aio::{AioControl, AioHandle, SUBMIT_BATCH_SIZE};
use crate::error::{AioError, Result};
use crate::trap;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ============================================================================
// Operation Kinds
// ============================================================================

/// Kind of I/O operation carried by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AioOp {
    /// No operation defined yet
    Invalid = 0,
    /// Vectored read
    Read = 1,
    /// Vectored write
    Write = 2,
    /// File sync
    Fsync = 3,
    /// Range writeback hint
    FlushRange = 4,
    /// Completes immediately without touching storage
    Nop = 5,
}

impl From<u8> for AioOp {
    fn from(v: u8) -> Self {
        match v {
            1 => AioOp::Read,
            2 => AioOp::Write,
            3 => AioOp::Fsync,
            4 => AioOp::FlushRange,
            5 => AioOp::Nop,
            _ => AioOp::Invalid,
        }
    }
}

impl AioOp {
    /// Human-readable name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            AioOp::Invalid => "invalid",
            AioOp::Read => "read",
            AioOp::Write => "write",
            AioOp::Fsync => "fsync",
            AioOp::FlushRange => "flush_range",
            AioOp::Nop => "nop",
        }
    }
}

/// Typed view of a handle's operation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioOpData {
    None,
    Read {
        fd: RawFd,
        offset: u64,
        iov_length: usize,
    },
    Write {
        fd: RawFd,
        offset: u64,
        iov_length: usize,
    },
}

// ============================================================================
// Gather/Scatter Segments
// ============================================================================

/// One gather/scatter segment of a vectored operation.
///
/// Carries a raw pointer because the target is shared buffer-pool or bounce
/// memory whose lifetime is managed by pin counts and handle ownership, not
/// by the borrow checker. The process executing the I/O is the only one
/// dereferencing it, after observing `IN_FLIGHT`.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: *mut u8,
    pub len: usize,
}

impl IoVec {
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

impl AioControl {
    /// Reconstruct the typed operation payload of a handle. Used by shared
    /// callbacks and the reopen hook, which run in arbitrary processes.
    pub fn handle_op_data(&self, idx: usize) -> AioOpData {
        let slot = &self.handles[idx];
        let fd = slot.op_fd.load(Ordering::Relaxed);
        let offset = slot.op_offset.load(Ordering::Relaxed);
        let iov_length = slot.op_iov_length.load(Ordering::Relaxed) as usize;

        match AioOp::from(slot.op.load(Ordering::Relaxed)) {
            AioOp::Read => AioOpData::Read {
                fd,
                offset,
                iov_length,
            },
            AioOp::Write => AioOpData::Write {
                fd,
                offset,
                iov_length,
            },
            _ => AioOpData::None,
        }
    }

    /// The opaque per-segment payloads of a handle's iovec window.
    pub fn handle_data(&self, idx: usize) -> Vec<u64> {
        let slot = &self.handles[idx];
        let len = slot.iovec_data_len.load(Ordering::Relaxed) as usize;
        debug_assert!(len > 0);
        let off = slot.iovec_off as usize;
        (0..len)
            .map(|i| self.iovec_data[off + i].load(Ordering::Relaxed))
            .collect()
    }
}

// ============================================================================
// Preparation & Synchronous Execution
// ============================================================================

impl AioBackend {
    /// Number of iovec slots a handle may use, captured at initialization.
    pub fn io_iovec_limit(&self) -> usize {
        self.ctl.io_combine_limit
    }

    /// Fill the handle's iovec window. Only legal while handed out.
    pub fn io_set_iovec(&mut self, h: AioHandle, segments: &[IoVec]) -> Result<()> {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);

        if segments.is_empty() || segments.len() > self.ctl.io_combine_limit {
            return Err(AioError::InvalidArgument(format!(
                "iovec count {} outside 1..={}",
                segments.len(),
                self.ctl.io_combine_limit
            )));
        }

        let off = self.slot(h.idx).iovec_off as usize;
        for (i, seg) in segments.iter().enumerate() {
            self.ctl.iovecs[off + i]
                .base
                .store(seg.base as usize, Ordering::Relaxed);
            self.ctl.iovecs[off + i].len.store(seg.len, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Attach opaque per-segment payloads (e.g. buffer identifiers) that
    /// completion callbacks will read back.
    pub fn io_set_handle_data(&mut self, h: AioHandle, data: &[u32]) -> Result<()> {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);

        if data.is_empty() || data.len() > self.ctl.io_combine_limit {
            return Err(AioError::InvalidArgument(format!(
                "handle data count {} outside 1..={}",
                data.len(),
                self.ctl.io_combine_limit
            )));
        }

        let off = self.slot(h.idx).iovec_off as usize;
        for (i, v) in data.iter().enumerate() {
            self.ctl.iovec_data[off + i].store(*v as u64, Ordering::Relaxed);
        }
        self.slot(h.idx)
            .iovec_data_len
            .store(data.len() as u8, Ordering::Relaxed);
        Ok(())
    }

    /// Read back the handle's opaque per-segment payloads.
    pub fn io_handle_data(&self, h: AioHandle) -> Vec<u64> {
        self.ctl.handle_data(h.idx)
    }

    /// Typed operation payload of a handle.
    pub fn io_op_data(&self, h: AioHandle) -> AioOpData {
        self.ctl.handle_op_data(h.idx)
    }

    fn io_before_prep(&self, h: AioHandle) {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);
        debug_assert!(self.io_has_subject(h));
    }

    /// Fix a vectored read over the handle's iovec window.
    pub fn io_prep_readv(&mut self, h: AioHandle, fd: RawFd, iovcnt: usize, offset: u64) {
        self.io_before_prep(h);
        debug_assert!(iovcnt >= 1 && iovcnt <= self.ctl.io_combine_limit);

        let slot = self.slot(h.idx);
        slot.op_fd.store(fd, Ordering::Relaxed);
        slot.op_offset.store(offset, Ordering::Relaxed);
        slot.op_iov_length.store(iovcnt as u32, Ordering::Relaxed);

        self.io_prepare(h, AioOp::Read);
    }

    /// Fix a vectored write over the handle's iovec window.
    pub fn io_prep_writev(&mut self, h: AioHandle, fd: RawFd, iovcnt: usize, offset: u64) {
        self.io_before_prep(h);
        debug_assert!(iovcnt >= 1 && iovcnt <= self.ctl.io_combine_limit);

        let slot = self.slot(h.idx);
        slot.op_fd.store(fd, Ordering::Relaxed);
        slot.op_offset.store(offset, Ordering::Relaxed);
        slot.op_iov_length.store(iovcnt as u32, Ordering::Relaxed);

        self.io_prepare(h, AioOp::Write);
    }

    /// Shared tail of the `io_prep_*` family: fix the op, run subject
    /// prepare callbacks, then stage or execute.
    fn io_prepare(&mut self, h: AioHandle, op: AioOp) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[h.idx];

        debug_assert_eq!(slot.state(), HandleState::HandedOut);
        debug_assert!(self.io_has_subject(h));

        slot.op.store(op as u8, Ordering::Relaxed);
        slot.result.store(0, Ordering::Relaxed);
        slot.publish_state(HandleState::Defined);

        // Allow a new IO to be staged while this one finishes preparing.
        self.handed_out_io = None;

        self.prepare_subject(h.idx);

        slot.publish_state(HandleState::Prepared);

        tracing::debug!(io = h.idx, op = op.name(), "prepared");

        if !self.needs_synchronous_execution(h.idx) {
            self.staged_ios.push(h.idx);
            debug_assert!(self.staged_ios.len() <= SUBMIT_BATCH_SIZE);
        } else {
            self.io_prepare_submit(h.idx);
            self.io_perform_synchronously(h.idx);
        }
    }

    /// Execute a handle's operation with a plain blocking syscall and drive
    /// completion. The raw signed return lands in `result`, with a negative
    /// errno on failure.
    pub(crate) fn io_perform_synchronously(&mut self, idx: usize) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[idx];

        debug_assert_eq!(slot.state(), HandleState::InFlight);

        let op = AioOp::from(slot.op.load(Ordering::Relaxed));
        let fd = slot.op_fd.load(Ordering::Relaxed);
        let offset = slot.op_offset.load(Ordering::Relaxed);
        let iovcnt = slot.op_iov_length.load(Ordering::Relaxed) as usize;

        let ret: isize = match op {
            AioOp::Read => {
                let iov = self.build_iovec(slot.iovec_off as usize, iovcnt);
                unsafe {
                    libc::preadv(fd, iov.as_ptr(), iovcnt as libc::c_int, offset as libc::off_t)
                        as isize
                }
            }
            AioOp::Write => {
                let iov = self.build_iovec(slot.iovec_off as usize, iovcnt);
                unsafe {
                    libc::pwritev(fd, iov.as_ptr(), iovcnt as libc::c_int, offset as libc::off_t)
                        as isize
                }
            }
            AioOp::Fsync => unsafe { libc::fsync(fd) as isize },
            AioOp::Nop => 0,
            AioOp::Invalid | AioOp::FlushRange => {
                trap!("synchronous execution undefined for op {}", op.name());
            }
        };

        let result = if ret < 0 {
            -(std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO) as i64)
        } else {
            ret as i64
        };

        self.io_process_completion(idx, result);
    }

    fn build_iovec(&self, off: usize, iovcnt: usize) -> Vec<libc::iovec> {
        (0..iovcnt)
            .map(|i| libc::iovec {
                iov_base: self.ctl.iovecs[off + i].base.load(Ordering::Relaxed)
                    as *mut libc::c_void,
                iov_len: self.ctl.iovecs[off + i].len.load(Ordering::Relaxed),
            })
            .collect()
    }
}
