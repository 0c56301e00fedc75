use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stowage_base::{ContentError, ContentResult, LoadHandle};

use crate::operation::OperationState;

// One entry in the registry. Each operation has its own lock so that workers, the integration pass
// and callers only contend when they touch the same operation.
pub(crate) struct OperationSlot {
    load_handle: LoadHandle,
    state: Mutex<OperationState>,
    changed: Condvar,
}

impl OperationSlot {
    pub(crate) fn load_handle(&self) -> LoadHandle {
        self.load_handle
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock()
    }

    // Wakes any thread blocked in wait_until_settled. Call after every phase change.
    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    // Returns true if the operation settled before the timeout
    pub(crate) fn wait_until_settled(
        &self,
        timeout: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        if !state.is_settled() {
            self.changed
                .wait_while_for(&mut state, |state| !state.is_settled(), timeout);
        }
        state.is_settled()
    }
}

/// Issues load handles and maps them to the state of the operation they track.
///
/// Handles are never reused. Once an operation is retired its handle stays invalid forever, so a
/// stale handle held by a caller cannot reach a newer operation.
pub struct HandleRegistry {
    next_handle_index: AtomicU64,
    slots: DashMap<LoadHandle, Arc<OperationSlot>, ahash::RandomState>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        HandleRegistry {
            // Start at 1, 0 is the null handle
            next_handle_index: AtomicU64::new(1),
            slots: DashMap::with_hasher(ahash::RandomState::default()),
        }
    }
}

impl HandleRegistry {
    pub(crate) fn issue(
        &self,
        state: OperationState,
    ) -> Arc<OperationSlot> {
        let load_handle = LoadHandle(self.next_handle_index.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(OperationSlot {
            load_handle,
            state: Mutex::new(state),
            changed: Condvar::new(),
        });
        let old = self.slots.insert(load_handle, slot.clone());
        debug_assert!(old.is_none());
        log::trace!("Issued handle {:?}", load_handle);
        slot
    }

    // Finds the entry for a handle, including entries that were released but not torn down yet
    pub(crate) fn lookup(
        &self,
        load_handle: LoadHandle,
    ) -> Option<Arc<OperationSlot>> {
        if load_handle.is_null() {
            return None;
        }

        self.slots.get(&load_handle).map(|x| x.value().clone())
    }

    // Finds the entry for a handle the caller is still allowed to use
    pub(crate) fn lookup_valid(
        &self,
        load_handle: LoadHandle,
    ) -> ContentResult<Arc<OperationSlot>> {
        match self.lookup(load_handle) {
            Some(slot) if !slot.lock().released => Ok(slot),
            _ => Err(ContentError::InvalidHandle(load_handle)),
        }
    }

    pub fn is_valid(
        &self,
        load_handle: LoadHandle,
    ) -> bool {
        self.lookup_valid(load_handle).is_ok()
    }

    // Removes the entry. Operations that depend on it may still hold it alive until they finish.
    pub(crate) fn retire(
        &self,
        load_handle: LoadHandle,
    ) -> Option<Arc<OperationSlot>> {
        let removed = self.slots.remove(&load_handle).map(|(_, slot)| slot);
        if removed.is_some() {
            log::trace!("Retired handle {:?}", load_handle);
        }
        removed
    }

    // Snapshot of every entry, in no particular order
    pub(crate) fn slots(&self) -> Vec<Arc<OperationSlot>> {
        self.slots.iter().map(|x| x.value().clone()).collect()
    }

    /// Number of entries that have not been retired yet, including released ones awaiting teardown
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
