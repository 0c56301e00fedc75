use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stowage_base::{
    ContentError, ContentNamespace, ContentSceneParameters, DependencyFence, LoadFailure, LoadHandle,
    LoadingStatus, ObjectGraph, SceneHandle, SceneLoadingStatus,
};

use crate::registry::OperationSlot;

#[derive(Clone, Debug)]
pub(crate) enum OperationKind {
    File,
    Scene {
        scene_name: String,
        parameters: ContentSceneParameters,
    },
}

impl OperationKind {
    pub(crate) fn is_scene(&self) -> bool {
        matches!(self, OperationKind::Scene { .. })
    }
}

// Internal phase shared by file and scene operations. The declaration order is the order phases
// move in, so a transition is legal only if it moves to a later phase from a non-terminal one.
// Files skip the two integration phases.
#[derive(Copy, Clone, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub(crate) enum OperationPhase {
    // Waiting on dependencies or a fence, queued for a worker, or being loaded by a worker
    InProgress,
    // Scene only: object data loaded, nothing grafted yet
    WaitingForIntegrate,
    // Scene only: queued for the next integration pass
    WillIntegrateNextFrame,
    Completed,
    Failed,
}

impl OperationPhase {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, OperationPhase::Completed | OperationPhase::Failed)
    }

    pub(crate) fn loading_status(&self) -> LoadingStatus {
        match self {
            OperationPhase::Completed => LoadingStatus::Completed,
            OperationPhase::Failed => LoadingStatus::Failed,
            _ => LoadingStatus::InProgress,
        }
    }

    pub(crate) fn scene_loading_status(&self) -> SceneLoadingStatus {
        match self {
            OperationPhase::InProgress => SceneLoadingStatus::InProgress,
            OperationPhase::WaitingForIntegrate => SceneLoadingStatus::WaitingForIntegrate,
            OperationPhase::WillIntegrateNextFrame => SceneLoadingStatus::WillIntegrateNextFrame,
            OperationPhase::Completed => SceneLoadingStatus::Complete,
            OperationPhase::Failed => SceneLoadingStatus::Failed,
        }
    }
}

// Signalled once teardown of an unloaded file has finished
#[derive(Default)]
pub(crate) struct UnloadCompletion {
    done: Mutex<bool>,
    changed: Condvar,
}

impl UnloadCompletion {
    pub(crate) fn completed() -> Arc<Self> {
        Arc::new(UnloadCompletion {
            done: Mutex::new(true),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self) {
        *self.done.lock() = true;
        self.changed.notify_all();
    }
}

/// Returned by `unload_async`. Completes once the file's registry entry has been torn down, or
/// immediately if the unload only released one of several shared references.
#[derive(Clone)]
pub struct ContentFileUnloadHandle {
    load_handle: LoadHandle,
    completion: Arc<UnloadCompletion>,
}

impl ContentFileUnloadHandle {
    pub(crate) fn new(
        load_handle: LoadHandle,
        completion: Arc<UnloadCompletion>,
    ) -> Self {
        ContentFileUnloadHandle {
            load_handle,
            completion,
        }
    }

    /// The handle of the file being unloaded. It is no longer valid.
    pub fn load_handle(&self) -> LoadHandle {
        self.load_handle
    }

    pub fn is_completed(&self) -> bool {
        *self.completion.done.lock()
    }

    /// Blocks until teardown finished or the timeout elapsed. Returns true if teardown finished.
    pub fn wait_for_completion(
        &self,
        timeout_ms: u64,
    ) -> bool {
        let mut done = self.completion.done.lock();
        if !*done {
            self.completion.changed.wait_while_for(
                &mut done,
                |done| !*done,
                Duration::from_millis(timeout_ms),
            );
        }
        *done
    }
}

impl std::fmt::Debug for ContentFileUnloadHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ContentFileUnloadHandle")
            .field("load_handle", &self.load_handle)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// Everything the loader knows about one load operation. Lives behind the per-operation mutex in
// OperationSlot; phase changes go through advance() so they can only move forward.
pub(crate) struct OperationState {
    pub(crate) kind: OperationKind,
    pub(crate) namespace: ContentNamespace,
    pub(crate) filename: String,
    pub(crate) dependencies: Vec<LoadHandle>,
    pub(crate) fence: DependencyFence,
    // Order the operation was enqueued in, for diagnostics
    pub(crate) sequence: u64,

    phase: OperationPhase,
    pub(crate) failure: Option<LoadFailure>,
    // Only set once the objects are safe to hand out
    pub(crate) objects: Option<Arc<ObjectGraph>>,
    // Scene the objects were grafted into, once integrated
    pub(crate) scene: Option<SceneHandle>,

    // Number of load calls that returned this operation and have not been unloaded
    pub(crate) ref_count: u32,
    // Set when ref_count reaches zero. The handle is invalid from then on even though the entry
    // stays in the registry until teardown.
    pub(crate) released: bool,
    // Teardown has to wait for the operation to stop being in flight
    pub(crate) teardown_pending: bool,
    pub(crate) unload_completion: Option<Arc<UnloadCompletion>>,

    // Number of dependencies/fences (plus a guard count while enqueueing) that have to clear before
    // a worker may start on this operation
    pub(crate) blocking_dependency_count: u32,
    // The first dependency that failed, if any. The load is failed without being attempted.
    pub(crate) failed_dependency: Option<LoadHandle>,
    // Operations waiting on this one to finish
    pub(crate) blocked_loads: Vec<Weak<OperationSlot>>,
    // Keeps dependency entries alive while this operation may still read their objects
    pub(crate) dependency_slots: Vec<Arc<OperationSlot>>,
    // Counted against the scheduler's queue ceiling until a worker picks it up
    pub(crate) counted_in_queue: bool,

    // Scene only: integrate_at_end_of_frame was called before the data finished loading
    pub(crate) integrate_requested: bool,

    pub(crate) load_started: Option<Instant>,
    pub(crate) load_finished: Option<Instant>,
}

impl OperationState {
    pub(crate) fn new(
        kind: OperationKind,
        namespace: ContentNamespace,
        filename: String,
        dependencies: Vec<LoadHandle>,
        fence: DependencyFence,
        sequence: u64,
    ) -> Self {
        OperationState {
            kind,
            namespace,
            filename,
            dependencies,
            fence,
            sequence,
            phase: OperationPhase::InProgress,
            failure: None,
            objects: None,
            scene: None,
            ref_count: 1,
            released: false,
            teardown_pending: false,
            unload_completion: None,
            blocking_dependency_count: 0,
            failed_dependency: None,
            blocked_loads: Vec::default(),
            dependency_slots: Vec::default(),
            counted_in_queue: false,
            integrate_requested: false,
            load_started: None,
            load_finished: None,
        }
    }

    pub(crate) fn phase(&self) -> OperationPhase {
        self.phase
    }

    // True once no worker will touch the operation again. Scenes that are waiting on the
    // integration pass count as settled.
    pub(crate) fn is_settled(&self) -> bool {
        if self.kind.is_scene() {
            self.phase != OperationPhase::InProgress
        } else {
            self.phase.is_terminal()
        }
    }

    // Moves the phase forward. Returns false (and leaves the phase alone) for any transition that
    // would go backwards, leave a terminal phase, or put a file into an integration phase.
    pub(crate) fn advance(
        &mut self,
        to: OperationPhase,
    ) -> bool {
        let integration_phase = matches!(
            to,
            OperationPhase::WaitingForIntegrate | OperationPhase::WillIntegrateNextFrame
        );
        if self.phase.is_terminal() || to <= self.phase || (integration_phase && !self.kind.is_scene())
        {
            log::warn!(
                "Rejected phase transition {:?} -> {:?} for {:?}",
                self.phase,
                to,
                self.filename
            );
            return false;
        }

        self.phase = to;
        if self.load_finished.is_none()
            && (to.is_terminal() || to == OperationPhase::WaitingForIntegrate)
        {
            self.load_finished = Some(Instant::now());
        }
        true
    }

    pub(crate) fn fail(
        &mut self,
        failure: LoadFailure,
    ) -> bool {
        if self.advance(OperationPhase::Failed) {
            self.failure = Some(failure);
            true
        } else {
            false
        }
    }

    // Error handed to callers asking for data from a failed operation
    pub(crate) fn failure_error(
        &self,
        load_handle: LoadHandle,
    ) -> ContentError {
        match &self.failure {
            Some(failure) => failure.clone().into(),
            None => ContentError::NotYetComplete(load_handle),
        }
    }

    pub(crate) fn load_duration(&self) -> Option<Duration> {
        match (self.load_started, self.load_finished) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }
}
