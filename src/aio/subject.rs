// # Subjects & Completion Callbacks
//
// A subject is the kind of object an I/O targets (a buffered page, a
// temporary-file page, ...). Subjects drive specialized behavior through a
// bounded ordered chain of shared completion callbacks plus an optional
// reopen hook for processes that do not have the original file descriptor.
//
// Shared callbacks run in the reaping process, which may not be the issuer,
// so they are plain function pointers over the shared control block: they
// can update shared state and distill the raw syscall return into an
// `AioResult`, but they cannot touch issuer-local memory and cannot raise.
// Errors surface on the issuer's side when it inspects the distilled result
// delivered through its return slot.

use crate::aio::control::AioBackend;
use crate::aio::handle::HandleState;
use crate::aio::{AioControl, AioHandle, AIO_MAX_SHARED_CALLBACKS};
use crate::error::{AioError, Result};
use crate::trap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ============================================================================
// Subjects
// ============================================================================

/// Index into the subject table.
pub type AioSubjectId = u8;

/// The invalid subject every handle starts out with.
pub const SUBJECT_INVALID: AioSubjectId = 0;

/// Static description of one subject kind.
#[derive(Clone, Copy)]
pub struct AioSubjectInfo {
    /// Diagnostic name
    pub name: &'static str,

    /// Reopen the I/O's target in a process that does not have the
    /// original file descriptor open.
    pub reopen: Option<fn(&AioControl, usize)>,
}

// ============================================================================
// Distilled Results
// ============================================================================

/// Coarse status of a distilled I/O result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AioResultStatus {
    /// Callbacks have not run
    Unknown = 0,
    /// The operation succeeded
    Ok = 1,
    /// Fewer bytes transferred than requested
    Partial = 2,
    /// The operation failed
    Error = 3,
}

impl From<u8> for AioResultStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => AioResultStatus::Ok,
            2 => AioResultStatus::Partial,
            3 => AioResultStatus::Error,
            _ => AioResultStatus::Unknown,
        }
    }
}

/// Result of an I/O after the shared completion callbacks distilled it.
///
/// Packs into 64 bits so it can live in the handle slot as a single atomic:
/// the raw (possibly truncated) syscall return, an error payload, and the
/// id of the callback that owns the error formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioResult {
    pub status: AioResultStatus,
    /// Callback id responsible for formatting `error_data`
    pub id: AioSharedCallbackId,
    /// Callback-defined error payload (e.g. an errno)
    pub error_data: u16,
    /// Raw signed syscall return
    pub result: i32,
}

impl AioResult {
    pub const UNKNOWN: AioResult = AioResult {
        status: AioResultStatus::Unknown,
        id: 0,
        error_data: 0,
        result: 0,
    };

    pub(crate) fn to_bits(self) -> u64 {
        ((self.status as u64) << 56)
            | ((self.id as u64) << 48)
            | ((self.error_data as u64) << 32)
            | (self.result as u32 as u64)
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        Self {
            status: AioResultStatus::from((bits >> 56) as u8),
            id: (bits >> 48) as u8,
            error_data: (bits >> 32) as u16,
            result: bits as u32 as i32,
        }
    }
}

/// Distilled result plus subject payload, delivered to the issuer's return
/// slot when the handle is reclaimed.
#[derive(Debug, Clone, Copy)]
pub struct AioReturn {
    pub result: AioResult,
    pub subject_data: u64,
}

impl Default for AioReturn {
    fn default() -> Self {
        Self {
            result: AioResult::UNKNOWN,
            subject_data: 0,
        }
    }
}

impl AioReturn {
    /// Raise the distilled result as an error on the issuer's path.
    pub fn raise(&self) -> Result<()> {
        match self.result.status {
            AioResultStatus::Unknown | AioResultStatus::Ok => Ok(()),
            AioResultStatus::Partial => Err(AioError::IoFailure(format!(
                "partial IO: transferred {} bytes",
                self.result.result
            ))),
            AioResultStatus::Error => Err(AioError::IoFailure(format!(
                "IO failed with error data {} (raw result {})",
                self.result.error_data, self.result.result
            ))),
        }
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Severity a subject error callback formats its diagnostic at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioLogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl AioLogLevel {
    /// Emit a message at this severity.
    pub fn emit(&self, message: &str) {
        match self {
            AioLogLevel::Error => tracing::error!("{}", message),
            AioLogLevel::Warning => tracing::warn!("{}", message),
            AioLogLevel::Info => tracing::info!("{}", message),
            AioLogLevel::Debug => tracing::debug!("{}", message),
        }
    }
}

// ============================================================================
// Shared Callbacks
// ============================================================================

/// Index into the shared-callback table.
pub type AioSharedCallbackId = u8;

/// One entry of the shared-callback table. Function pointers only: the
/// table must behave identically in every process of the group.
#[derive(Clone, Copy)]
pub struct AioSharedCallbacks {
    /// Diagnostic name
    pub name: &'static str,

    /// Runs at prepare time in the issuing process; may adjust the
    /// subject payload.
    pub prepare: Option<fn(&AioControl, usize)>,

    /// Runs at completion time in the reaping process; receives the
    /// running distilled result and returns the updated one.
    pub complete: fn(&AioControl, usize, AioResult) -> AioResult,

    /// Formats a diagnostic for a failed I/O at the issuer's chosen
    /// severity.
    pub error: Option<fn(AioResult, u64, AioLogLevel)>,
}

/// Registry of subjects and shared callbacks, built identically at startup
/// in every process and frozen into the control block.
pub struct AioCallbackRegistry {
    subjects: Vec<AioSubjectInfo>,
    callbacks: Vec<AioSharedCallbacks>,
}

impl AioCallbackRegistry {
    /// Create a registry holding only the invalid subject.
    pub fn new() -> Self {
        Self {
            subjects: vec![AioSubjectInfo {
                name: "invalid",
                reopen: None,
            }],
            callbacks: Vec::new(),
        }
    }

    /// Register a subject kind, returning its id.
    pub fn register_subject(&mut self, info: AioSubjectInfo) -> AioSubjectId {
        let id = self.subjects.len();
        debug_assert!(id <= u8::MAX as usize);
        self.subjects.push(info);
        id as AioSubjectId
    }

    /// Register a shared callback, returning its id.
    pub fn register_callback(&mut self, cbs: AioSharedCallbacks) -> AioSharedCallbackId {
        let id = self.callbacks.len();
        debug_assert!(id <= u8::MAX as usize);
        self.callbacks.push(cbs);
        id as AioSharedCallbackId
    }

    pub(crate) fn into_tables(self) -> (Vec<AioSubjectInfo>, Vec<AioSharedCallbacks>) {
        (self.subjects, self.callbacks)
    }
}

impl Default for AioCallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Control-Side Accessors
// ============================================================================

impl AioControl {
    /// Diagnostic name of a handle's subject.
    pub fn handle_subject_name(&self, idx: usize) -> &'static str {
        let subject = self.handles[idx].subject.load(Ordering::Relaxed) as usize;
        debug_assert!(subject < self.subjects.len());
        self.subjects[subject].name
    }

    /// The opaque per-subject payload of a handle.
    pub fn subject_data(&self, idx: usize) -> u64 {
        self.handles[idx].scb_data.load(Ordering::Relaxed)
    }

    /// Overwrite the per-subject payload; used by prepare callbacks.
    pub fn set_subject_data(&self, idx: usize, data: u64) {
        self.handles[idx].scb_data.store(data, Ordering::Relaxed);
    }

    /// Raw signed syscall result of a handle.
    pub fn raw_result(&self, idx: usize) -> i64 {
        self.handles[idx].result.load(Ordering::Relaxed)
    }

    /// Whether a handle's subject can reopen its target in this process.
    pub fn handle_can_reopen(&self, idx: usize) -> bool {
        let subject = self.handles[idx].subject.load(Ordering::Relaxed) as usize;
        self.subjects[subject].reopen.is_some()
    }

    /// Invoke the subject's reopen hook.
    pub fn handle_reopen(&self, idx: usize) {
        let subject = self.handles[idx].subject.load(Ordering::Relaxed) as usize;
        match self.subjects[subject].reopen {
            Some(reopen) => reopen(self, idx),
            None => trap!("subject {} cannot reopen", self.subjects[subject].name),
        }
    }

    /// Route a non-OK distilled result to the error formatter of the
    /// callback that produced it.
    pub fn result_log(&self, result: AioResult, subject_data: u64, level: AioLogLevel) -> Result<()> {
        debug_assert_ne!(result.status, AioResultStatus::Unknown);
        debug_assert_ne!(result.status, AioResultStatus::Ok);

        let scb = self
            .shared_cbs
            .get(result.id as usize)
            .ok_or_else(|| AioError::Callback(format!("callback {} is out of range", result.id)))?;

        match scb.error {
            Some(error) => {
                error(result, subject_data, level);
                Ok(())
            }
            None => Err(AioError::Callback(format!(
                "callback {} does not have an error formatter",
                result.id
            ))),
        }
    }
}

// ============================================================================
// Backend Operations
// ============================================================================

impl AioBackend {
    /// Set the subject of a handed-out handle.
    pub fn io_set_subject(&mut self, h: AioHandle, subject: AioSubjectId) {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);

        if subject as usize >= self.ctl.subjects.len() {
            trap!("subject {} is out of range", subject);
        }

        self.slot(h.idx).subject.store(subject, Ordering::Relaxed);

        tracing::debug!(
            io = h.idx,
            subject = self.ctl.handle_subject_name(h.idx),
            "set subject"
        );
    }

    /// Whether the handle has a subject other than the invalid one.
    pub fn io_has_subject(&self, h: AioHandle) -> bool {
        self.slot(h.idx).subject.load(Ordering::Relaxed) != SUBJECT_INVALID
    }

    /// Opaque per-subject payload of the handle.
    pub fn io_subject_data(&self, h: AioHandle) -> u64 {
        self.ctl.subject_data(h.idx)
    }

    /// Set the per-subject payload.
    pub fn io_set_subject_data(&mut self, h: AioHandle, data: u64) {
        self.ctl.set_subject_data(h.idx, data);
    }

    /// Append a shared completion callback. Must happen before preparation;
    /// the chain is bounded and ordered.
    pub fn io_add_shared_cb(&mut self, h: AioHandle, cbid: AioSharedCallbackId) -> Result<()> {
        debug_assert_eq!(self.slot(h.idx).state(), HandleState::HandedOut);

        if cbid as usize >= self.ctl.shared_cbs.len() {
            return Err(AioError::Callback(format!(
                "callback {} is out of range",
                cbid
            )));
        }

        let slot = self.slot(h.idx);
        let num = slot.num_shared_callbacks.load(Ordering::Relaxed) as usize;
        if num >= AIO_MAX_SHARED_CALLBACKS {
            trap!("too many callbacks, the max is {}", AIO_MAX_SHARED_CALLBACKS);
        }

        slot.shared_callbacks[num].store(cbid, Ordering::Relaxed);

        tracing::debug!(
            io = h.idx,
            cb = self.ctl.shared_cbs[cbid as usize].name,
            position = num,
            "adding shared callback"
        );

        slot.num_shared_callbacks
            .store(num as u8 + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the handle's subject can reopen its target here.
    pub fn io_can_reopen(&self, h: AioHandle) -> bool {
        self.ctl.handle_can_reopen(h.idx)
    }

    /// Reopen the handle's target in this process.
    pub fn io_reopen(&self, h: AioHandle) {
        self.ctl.handle_reopen(h.idx)
    }

    /// Run the prepare half of the callback chain, in reverse registration
    /// order so the latest-added callback prepares last.
    pub(crate) fn prepare_subject(&mut self, idx: usize) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[idx];

        debug_assert_ne!(
            slot.subject.load(Ordering::Relaxed),
            SUBJECT_INVALID,
            "IO prepared without a subject"
        );

        let num = slot.num_shared_callbacks.load(Ordering::Relaxed) as usize;
        for i in (0..num).rev() {
            let cbid = slot.shared_callbacks[i].load(Ordering::Relaxed) as usize;
            let cbs = &ctl.shared_cbs[cbid];

            if let Some(prepare) = cbs.prepare {
                tracing::trace!(io = idx, cb = cbs.name, "calling prepare callback");
                prepare(&ctl, idx);
            }
        }
    }

    /// Run the completion half of the chain in reverse registration order,
    /// distilling the raw result. Stores the final value in the handle for
    /// delivery at reclaim time.
    pub(crate) fn process_completion_subject(&mut self, idx: usize) {
        let ctl = Arc::clone(&self.ctl);
        let slot = &ctl.handles[idx];

        // The low-level IO itself is always considered OK; callbacks decide
        // what a negative or short result means for their subject.
        let mut result = AioResult {
            status: AioResultStatus::Ok,
            id: 0,
            error_data: 0,
            result: slot.result.load(Ordering::Relaxed) as i32,
        };

        let num = slot.num_shared_callbacks.load(Ordering::Relaxed) as usize;
        for i in (0..num).rev() {
            let cbid = slot.shared_callbacks[i].load(Ordering::Relaxed) as usize;
            let cbs = &ctl.shared_cbs[cbid];

            tracing::trace!(
                io = idx,
                cb = cbs.name,
                status = result.status as u8,
                "calling completion callback"
            );
            result = (cbs.complete)(&ctl, idx, result);
        }

        slot.distilled.store(result.to_bits(), Ordering::Relaxed);

        tracing::debug!(
            io = idx,
            status = result.status as u8,
            raw = slot.result.load(Ordering::Relaxed),
            "distilled result"
        );
    }
}
