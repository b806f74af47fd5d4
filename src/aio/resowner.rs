// # Resource-Owner Integration
//
// Transaction scopes track the AIO handles and bounce buffers acquired
// under them so that transaction end and error cleanup can reclaim what
// the normal path did not. The cycle between handles and owners is broken
// arena-style: the owner is an index into a backend-local arena holding
// lists of handle indices, and the handle's backend-local metadata holds
// the owner id. Reclaim nulls both sides.

use crate::aio::control::AioBackend;
use crate::aio::handle::HandleState;
use crate::trap;

/// Identifier of a resource owner in the backend-local arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerId(u32);

#[derive(Default)]
struct OwnerSlot {
    alive: bool,
    ios: Vec<usize>,
    bbs: Vec<usize>,
}

/// Backend-local arena of resource owners.
pub(crate) struct OwnerArena {
    slots: Vec<OwnerSlot>,
}

impl OwnerArena {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn slot_mut(&mut self, owner: OwnerId) -> &mut OwnerSlot {
        let slot = &mut self.slots[owner.0 as usize];
        debug_assert!(slot.alive);
        slot
    }

    fn create(&mut self) -> OwnerId {
        // Reuse a dead slot if one exists.
        if let Some(i) = self.slots.iter().position(|s| !s.alive) {
            self.slots[i].alive = true;
            return OwnerId(i as u32);
        }
        self.slots.push(OwnerSlot {
            alive: true,
            ios: Vec::new(),
            bbs: Vec::new(),
        });
        OwnerId(self.slots.len() as u32 - 1)
    }

    pub(crate) fn remember_io(&mut self, owner: OwnerId, idx: usize) {
        self.slot_mut(owner).ios.push(idx);
    }

    pub(crate) fn forget_io(&mut self, owner: OwnerId, idx: usize) {
        let ios = &mut self.slot_mut(owner).ios;
        if let Some(pos) = ios.iter().position(|&i| i == idx) {
            ios.swap_remove(pos);
        }
    }

    pub(crate) fn remember_bb(&mut self, owner: OwnerId, idx: usize) {
        self.slot_mut(owner).bbs.push(idx);
    }

    pub(crate) fn forget_bb(&mut self, owner: OwnerId, idx: usize) {
        let bbs = &mut self.slot_mut(owner).bbs;
        if let Some(pos) = bbs.iter().position(|&i| i == idx) {
            bbs.swap_remove(pos);
        }
    }

    /// Drain the owner's lists and mark it dead.
    fn take(&mut self, owner: OwnerId) -> (Vec<usize>, Vec<usize>) {
        let slot = self.slot_mut(owner);
        slot.alive = false;
        (std::mem::take(&mut slot.ios), std::mem::take(&mut slot.bbs))
    }
}

impl AioBackend {
    /// Open a new resource-owner scope.
    pub fn owner_create(&mut self) -> OwnerId {
        self.owners.create()
    }

    pub(crate) fn resowner_register_io(&mut self, idx: usize, owner: OwnerId) {
        debug_assert!(self.local(idx).resowner.is_none());
        self.owners.remember_io(owner, idx);
        self.local_mut(idx).resowner = Some(owner);
    }

    /// Release a resource-owner scope, walking every handle and bounce
    /// buffer still registered with it. `on_error` distinguishes error
    /// cleanup (silent) from a commit path, where a still-handed-out
    /// handle is a leak worth diagnosing.
    pub fn owner_release(&mut self, owner: OwnerId, on_error: bool) {
        let (ios, bbs) = self.owners.take(owner);

        for idx in ios {
            self.io_release_resowner(idx, on_error);
        }
        for idx in bbs {
            self.bounce_buffer_release_resowner(idx, on_error);
        }
    }

    fn io_release_resowner(&mut self, idx: usize, on_error: bool) {
        debug_assert!(self.local(idx).resowner.is_some());
        self.local_mut(idx).resowner = None;

        match self.slot(idx).state() {
            HandleState::Idle => {
                trap!("resource owner holds io:{} in idle state", idx);
            }
            HandleState::HandedOut => {
                debug_assert!(
                    self.handed_out_io == Some(idx) || self.handed_out_io.is_none()
                );

                if self.handed_out_io == Some(idx) {
                    self.handed_out_io = None;
                    if !on_error {
                        tracing::warn!(io = idx, "leaked AIO handle");
                    }
                }

                self.io_reclaim(idx);
            }
            HandleState::Defined | HandleState::Prepared => {
                // Submit so the handle can proceed to completion.
                self.submit_staged();
            }
            HandleState::InFlight | HandleState::Reaped | HandleState::CompletedShared => {
                // Expected; the normal completion path picks these up.
            }
            HandleState::CompletedLocal => {
                self.io_reclaim(idx);
            }
        }

        // The caller memory behind the return slot likely no longer lives.
        self.local_mut(idx).report = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::{AioCallbackRegistry, AioControl};
    use crate::config::AioConfig;

    fn backend() -> AioBackend {
        AioControl::initialize(&AioConfig::default(), 1, AioCallbackRegistry::new())
            .unwrap()
            .attach(0)
            .unwrap()
    }

    #[test]
    fn test_release_empty_owner() {
        let mut backend = backend();
        let owner = backend.owner_create();
        backend.owner_release(owner, false);
    }

    #[test]
    fn test_handed_out_handle_is_reclaimed_on_release() {
        let mut backend = backend();
        let owner = backend.owner_create();

        let h = backend.io_get_nb(Some(owner), None).unwrap();
        let idx = h.idx;

        // Commit-path release of a still handed-out handle: the leak is
        // diagnosed and the handle forcibly reclaimed.
        backend.owner_release(owner, false);

        assert!(backend.handed_out_io.is_none());
        assert_eq!(backend.slot(idx).state(), HandleState::Idle);

        // The handle is acquirable again.
        let h2 = backend.io_get_nb(None, None).unwrap();
        backend.io_release(h2);
    }

    #[test]
    fn test_reclaim_deregisters_from_owner() {
        let mut backend = backend();
        let owner = backend.owner_create();

        let h = backend.io_get_nb(Some(owner), None).unwrap();
        backend.io_release(h);

        // Release after normal reclaim must not touch the handle again.
        backend.owner_release(owner, false);
        assert_eq!(backend.idle_ios.len(), 32);
    }

    #[test]
    fn test_owner_ids_are_reused() {
        let mut backend = backend();
        let a = backend.owner_create();
        backend.owner_release(a, false);
        let b = backend.owner_create();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bounce_buffer_leak_is_released() {
        let mut backend = backend();
        let owner = backend.owner_create();

        let before = backend.idle_bbs.len();
        let _bb = backend.bounce_buffer_get(Some(owner));
        assert_eq!(backend.idle_bbs.len(), before - 1);

        backend.owner_release(owner, true);
        assert_eq!(backend.idle_bbs.len(), before);
        assert!(backend.handed_out_bb.is_none());
    }
}
