// # I/O Methods & Submission Batching
//
// The I/O method is a capability set {submit, wait_one?, needs_sync?}
// selected by configuration at initialization time and dispatched as a
// tagged variant, so adding a kernel completion interface later costs no
// per-operation indirection.
//
// Only the `sync` method exists: its submit function walks the staged batch
// in FIFO order, transitions each handle to IN_FLIGHT, performs the syscall
// and drives completion on the spot. The observable contract is only that
// every staged handle eventually reaches COMPLETED_SHARED.

use crate::aio::control::AioBackend;
use crate::aio::AIO_HF_REFERENCES_LOCAL;
use crate::config::IoMethodKind;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

impl AioBackend {
    /// Flush the staged submission batch.
    ///
    /// Runs inside a critical section because handle acquisition, and
    /// therefore submission of a full batch, must be legal in one.
    pub fn submit_staged(&mut self) {
        if self.staged_ios.is_empty() {
            return;
        }

        self.begin_critical_section();
        let submitted = match self.ctl.method {
            IoMethodKind::Sync => self.sync_submit(),
        };
        self.end_critical_section();

        self.stats.submissions += submitted as u64;
        self.stats.batches += 1;
        debug_assert!(self.staged_ios.is_empty());

        tracing::debug!(submitted, "submitted staged IOs");
    }

    /// The `sync` method's submit: execute each staged I/O immediately.
    fn sync_submit(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged_ios);
        let submitted = staged.len();

        for idx in staged {
            self.io_prepare_submit(idx);
            self.io_perform_synchronously(idx);
        }

        submitted
    }

    /// Whether the handle must execute in the issuing process rather than
    /// being staged. True when it references backend-local memory no other
    /// process could complete, or when the method has no asynchrony at all
    /// for this operation.
    pub(crate) fn needs_synchronous_execution(&self, idx: usize) -> bool {
        if self.slot(idx).flags.load(Ordering::Relaxed) & AIO_HF_REFERENCES_LOCAL != 0 {
            return true;
        }

        match self.ctl.method {
            IoMethodKind::Sync => false,
        }
    }

    /// Targeted wait for one in-flight handle, if the method provides one.
    /// Returns false when the caller should fall back to the handle's
    /// condition variable.
    pub(crate) fn method_wait_one(&mut self, _idx: usize, _ref_generation: u64) -> bool {
        match self.ctl.method {
            IoMethodKind::Sync => false,
        }
    }

    /// A file descriptor is about to be closed: staged I/Os may target it,
    /// so flush them all rather than tracking which ones do.
    pub fn closing_fd(&mut self, _fd: RawFd) {
        self.submit_staged();
    }
}
