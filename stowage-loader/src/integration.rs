use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage_base::{
    ContentError, ContentResult, ContentSceneFile, IntegrationError, LoadFailure, ObjectGraph,
    SceneHandle,
};

use crate::config::validate_integration_time_ms;
use crate::operation::{OperationKind, OperationPhase};
use crate::registry::OperationSlot;
use crate::scheduler::SchedulerShared;
use crate::storage::{SceneHost, SceneInstantiateInfo};

// Scenes waiting for the next integration pass, in the order they became eligible
#[derive(Default)]
pub(crate) struct IntegrationQueue {
    pending_integrations: Mutex<VecDeque<Arc<OperationSlot>>>,
    pending_unloads: Mutex<VecDeque<Arc<OperationSlot>>>,
}

impl IntegrationQueue {
    pub(crate) fn push_integration(
        &self,
        slot: Arc<OperationSlot>,
    ) {
        log::trace!("Scene {:?} queued for integration", slot.load_handle());
        self.pending_integrations.lock().push_back(slot);
    }

    fn pop_integration(&self) -> Option<Arc<OperationSlot>> {
        self.pending_integrations.lock().pop_front()
    }

    fn integration_count(&self) -> usize {
        self.pending_integrations.lock().len()
    }

    fn push_unload(
        &self,
        slot: Arc<OperationSlot>,
    ) {
        self.pending_unloads.lock().push_back(slot);
    }

    fn take_unloads(&self) -> VecDeque<Arc<OperationSlot>> {
        std::mem::take(&mut *self.pending_unloads.lock())
    }

    fn unload_count(&self) -> usize {
        self.pending_unloads.lock().len()
    }
}

/// What one integration pass did
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct IntegrationPassStats {
    /// Scenes grafted into the live scene graph
    pub integrated: usize,
    /// Scenes the host refused to instantiate or attach
    pub failed: usize,
    /// Scenes left in the queue for the next pass because the time budget ran out
    pub carried_over: usize,
    /// Scenes detached and retired
    pub unloaded: usize,
    pub elapsed: Duration,
}

/// Grafts loaded scenes into the live scene graph, a bounded amount of work per frame.
///
/// The gate never holds on to the scene host. It is lent for the duration of `run_pass`, which the
/// engine calls once per frame from the thread that owns the scene graph.
pub struct IntegrationGate {
    shared: Arc<SchedulerShared>,
    integration_time_ms: Mutex<f32>,
    pass_lock: Mutex<()>,
}

impl IntegrationGate {
    pub(crate) fn new(
        shared: Arc<SchedulerShared>,
        integration_time_ms: f32,
    ) -> ContentResult<Self> {
        validate_integration_time_ms(integration_time_ms)?;
        Ok(IntegrationGate {
            shared,
            integration_time_ms: Mutex::new(integration_time_ms),
            pass_lock: Mutex::new(()),
        })
    }

    pub fn integration_time_ms(&self) -> f32 {
        *self.integration_time_ms.lock()
    }

    /// Takes effect on the next pass
    pub fn set_integration_time_ms(
        &self,
        integration_time_ms: f32,
    ) -> ContentResult<()> {
        validate_integration_time_ms(integration_time_ms).map_err(|e| {
            log::warn!("{}", e);
            e
        })?;
        *self.integration_time_ms.lock() = integration_time_ms;
        log::debug!("Integration time set to {}ms", integration_time_ms);
        Ok(())
    }

    pub fn pending_integration_count(&self) -> usize {
        self.shared.integration_queue.integration_count()
    }

    pub fn pending_unload_count(&self) -> usize {
        self.shared.integration_queue.unload_count()
    }

    fn lookup_scene(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<Arc<OperationSlot>> {
        let slot = self.shared.registry.lookup_valid(scene_file.0)?;
        if !slot.lock().kind.is_scene() {
            log::warn!("{:?} is not a scene load", scene_file.0);
            return Err(ContentError::InvalidHandle(scene_file.0));
        }

        Ok(slot)
    }

    /// Queues the scene for the next pass. If the scene is still loading, the request is latched
    /// and the scene is queued as soon as its data is ready.
    pub fn request_integration(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()> {
        let slot = self.lookup_scene(scene_file).map_err(|e| {
            log::warn!("Integrate request for invalid handle {:?}", scene_file.0);
            e
        })?;

        let mut state = slot.lock();
        match state.phase() {
            OperationPhase::InProgress => {
                state.integrate_requested = true;
                Ok(())
            }
            OperationPhase::WaitingForIntegrate => {
                state.advance(OperationPhase::WillIntegrateNextFrame);
                drop(state);
                slot.notify();
                self.shared.integration_queue.push_integration(slot);
                Ok(())
            }
            OperationPhase::WillIntegrateNextFrame | OperationPhase::Completed => Ok(()),
            OperationPhase::Failed => Err(state.failure_error(scene_file.0)),
        }
    }

    /// Invalidates the handle now. The scene is detached from the live scene graph and retired
    /// during the next pass, or the first pass after its data finished loading.
    pub fn request_unload(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()> {
        let slot = self.lookup_scene(scene_file).map_err(|e| {
            log::warn!("Unload request for invalid handle {:?}", scene_file.0);
            e
        })?;

        {
            let mut state = slot.lock();
            if state.released {
                return Err(ContentError::InvalidHandle(scene_file.0));
            }
            state.released = true;
            state.ref_count = 0;
        }

        log::debug!("Scene {:?} queued for unload", scene_file.0);
        self.shared.integration_queue.push_unload(slot);
        Ok(())
    }

    /// Processes pending unloads, then integrates queued scenes until the time budget runs out.
    ///
    /// At least one scene is integrated per pass if any are queued, so a budget smaller than the
    /// cost of a single scene still makes progress. Scenes queued while the pass runs wait for the
    /// next one.
    #[profiling::function]
    pub fn run_pass(
        &self,
        host: &mut dyn SceneHost,
    ) -> IntegrationPassStats {
        let _pass_guard = match self.pass_lock.try_lock() {
            Some(guard) => guard,
            None => {
                log::warn!("Integration pass is already running on another thread");
                return IntegrationPassStats::default();
            }
        };

        let pass_start = Instant::now();
        let budget = Duration::try_from_secs_f32(self.integration_time_ms() / 1000.0)
            .unwrap_or(Duration::MAX);
        let mut stats = IntegrationPassStats::default();

        self.process_unloads(host, &mut stats);

        let queue = &self.shared.integration_queue;
        let pending = queue.integration_count();
        let mut taken = 0;
        while taken < pending {
            if stats.integrated + stats.failed > 0 && pass_start.elapsed() >= budget {
                break;
            }

            let slot = match queue.pop_integration() {
                Some(slot) => slot,
                None => break,
            };
            taken += 1;

            match self.integrate_scene(host, &slot) {
                Some(true) => stats.integrated += 1,
                Some(false) => stats.failed += 1,
                None => {}
            }
        }

        stats.carried_over = pending - taken;
        stats.elapsed = pass_start.elapsed();
        if stats.integrated + stats.failed + stats.carried_over + stats.unloaded > 0 {
            log::debug!("Integration pass {:?}", stats);
        }
        stats
    }

    fn process_unloads(
        &self,
        host: &mut dyn SceneHost,
        stats: &mut IntegrationPassStats,
    ) {
        profiling::scope!("process_unloads");
        let mut carried_over = Vec::default();
        for slot in self.shared.integration_queue.take_unloads() {
            let scene = {
                let mut state = slot.lock();
                if state.phase() == OperationPhase::InProgress {
                    None
                } else {
                    state.dependency_slots.clear();
                    Some(state.scene.take())
                }
            };

            // Still loading, a worker may be using it
            let scene = match scene {
                Some(scene) => scene,
                None => {
                    carried_over.push(slot);
                    continue;
                }
            };

            if let Some(scene) = scene {
                profiling::scope!("SceneHost::detach");
                host.detach(scene);
            }

            self.shared.registry.retire(slot.load_handle());
            log::debug!("Scene {:?} unloaded", slot.load_handle());
            stats.unloaded += 1;
        }

        for slot in carried_over {
            self.shared.integration_queue.push_unload(slot);
        }
    }

    // Returns None if the scene was skipped, otherwise whether integration succeeded
    fn integrate_scene(
        &self,
        host: &mut dyn SceneHost,
        slot: &Arc<OperationSlot>,
    ) -> Option<bool> {
        let (objects, namespace, filename, scene_name, parameters) = {
            let state = slot.lock();
            if state.released || state.phase() != OperationPhase::WillIntegrateNextFrame {
                log::trace!("Skipping integration of {:?}", slot.load_handle());
                return None;
            }

            match (&state.kind, &state.objects) {
                (
                    OperationKind::Scene {
                        scene_name,
                        parameters,
                    },
                    Some(objects),
                ) => (
                    objects.clone(),
                    state.namespace.clone(),
                    state.filename.clone(),
                    scene_name.clone(),
                    *parameters,
                ),
                _ => return None,
            }
        };

        let info = SceneInstantiateInfo {
            namespace: &namespace,
            filename: &filename,
            scene_name: &scene_name,
            parameters,
        };

        let result = instantiate_and_attach(host, &objects, &info);
        match result {
            Ok(scene) => {
                slot.lock().scene = Some(scene);
                self.shared.complete_operation(slot);
                Some(true)
            }
            Err(e) => {
                self.shared
                    .fail_operation(slot, LoadFailure::Integration(e));
                Some(false)
            }
        }
    }
}

fn instantiate_and_attach(
    host: &mut dyn SceneHost,
    objects: &ObjectGraph,
    info: &SceneInstantiateInfo,
) -> Result<SceneHandle, IntegrationError> {
    let scene = {
        profiling::scope!("SceneHost::instantiate");
        host.instantiate(objects, info)?
    };

    profiling::scope!("SceneHost::attach");
    if let Err(e) = host.attach(scene) {
        host.discard(scene);
        return Err(e);
    }

    Ok(scene)
}
