use parking_lot::Mutex;
use std::sync::Weak;
use stowage_base::hashing::{HashMap, HashSet};
use stowage_base::{ContentError, ContentResult, DependencyFence};

use crate::registry::OperationSlot;

#[derive(Default)]
struct FenceTableInner {
    // Last generation handed out by issue()
    last_issued: u64,
    // Every generation at or below this has completed
    completed_watermark: u64,
    // Completed generations above the watermark
    completed_above_watermark: HashSet<u64>,
    global_table_ready: bool,
    // Operations blocked on a fence, keyed by generation
    waiters: HashMap<u64, Vec<Weak<OperationSlot>>>,
}

impl FenceTableInner {
    fn is_satisfied(
        &self,
        fence: DependencyFence,
    ) -> bool {
        if fence.is_none() {
            true
        } else if fence.is_global_table() {
            self.global_table_ready
        } else {
            let generation = fence.generation();
            generation <= self.completed_watermark
                || self.completed_above_watermark.contains(&generation)
        }
    }

    fn is_known(
        &self,
        fence: DependencyFence,
    ) -> bool {
        fence.is_none() || fence.is_global_table() || fence.generation() <= self.last_issued
    }
}

// Tracks which fences have been issued and completed, and which operations are waiting on them
#[derive(Default)]
pub(crate) struct FenceTable {
    inner: Mutex<FenceTableInner>,
}

impl FenceTable {
    pub(crate) fn issue(&self) -> DependencyFence {
        let mut inner = self.inner.lock();
        inner.last_issued += 1;
        DependencyFence::from_generation(inner.last_issued)
    }

    pub(crate) fn is_satisfied(
        &self,
        fence: DependencyFence,
    ) -> bool {
        self.inner.lock().is_satisfied(fence)
    }

    pub(crate) fn validate(
        &self,
        fence: DependencyFence,
    ) -> ContentResult<()> {
        if self.inner.lock().is_known(fence) {
            Ok(())
        } else {
            Err(ContentError::ConfigurationError(format!(
                "Fence {:?} was never issued",
                fence
            )))
        }
    }

    // Returns true if the fence is already satisfied. Otherwise the waiter is recorded and will be
    // returned by the complete call that satisfies the fence.
    pub(crate) fn satisfied_or_wait(
        &self,
        fence: DependencyFence,
        waiter: Weak<OperationSlot>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_satisfied(fence) {
            true
        } else {
            inner
                .waiters
                .entry(fence.generation())
                .or_default()
                .push(waiter);
            false
        }
    }

    pub(crate) fn complete(
        &self,
        fence: DependencyFence,
    ) -> ContentResult<Vec<Weak<OperationSlot>>> {
        let mut inner = self.inner.lock();
        if fence.is_none() || fence.is_global_table() {
            return Err(ContentError::ConfigurationError(format!(
                "Fence {:?} can't be completed explicitly",
                fence
            )));
        }

        if !inner.is_known(fence) {
            return Err(ContentError::ConfigurationError(format!(
                "Fence {:?} was never issued",
                fence
            )));
        }

        if inner.is_satisfied(fence) {
            return Err(ContentError::ConfigurationError(format!(
                "Fence {:?} was already completed",
                fence
            )));
        }

        let generation = fence.generation();
        inner.completed_above_watermark.insert(generation);
        loop {
            let next = inner.completed_watermark + 1;
            if !inner.completed_above_watermark.remove(&next) {
                break;
            }
            inner.completed_watermark = next;
        }

        log::debug!("Completed fence {:?}", fence);
        Ok(inner.waiters.remove(&generation).unwrap_or_default())
    }

    pub(crate) fn signal_global_table_ready(&self) -> ContentResult<Vec<Weak<OperationSlot>>> {
        let mut inner = self.inner.lock();
        if inner.global_table_ready {
            return Err(ContentError::ConfigurationError(
                "Global table was already signalled ready".to_string(),
            ));
        }

        inner.global_table_ready = true;
        log::debug!("Global table is ready");
        Ok(inner
            .waiters
            .remove(&DependencyFence::GLOBAL_TABLE.generation())
            .unwrap_or_default())
    }
}
