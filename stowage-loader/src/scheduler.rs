use crossbeam_channel::{Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use stowage_base::{
    ContentError, ContentFile, ContentNamespace, ContentResult, ContentSceneFile,
    ContentSceneParameters, DependencyFence, LoadFailure, LoadHandle, ObjectGraph, ObjectRef,
};

use crate::fence_table::FenceTable;
use crate::integration::IntegrationQueue;
use crate::operation::{
    ContentFileUnloadHandle, OperationKind, OperationPhase, OperationState, UnloadCompletion,
};
use crate::registry::{HandleRegistry, OperationSlot};
use crate::storage::{ContentDeserializer, ContentStoreReader};

pub(crate) enum SchedulerRequest {
    // Read, deserialize and resolve an operation whose dependencies are all complete
    Load(Arc<OperationSlot>),
    // Remove a released file from the registry once nothing is in flight for it
    Teardown(Arc<OperationSlot>),
}

// State shared by the worker threads, the integration gate and the public API
pub(crate) struct SchedulerShared {
    pub(crate) registry: HandleRegistry,
    pub(crate) fences: FenceTable,
    pub(crate) integration_queue: IntegrationQueue,
    store: Box<dyn ContentStoreReader>,
    deserializer: Box<dyn ContentDeserializer>,
    request_tx: Sender<SchedulerRequest>,
    queued_request_count: AtomicUsize,
    active_request_count: AtomicUsize,
    max_queued_requests: usize,
    share_identical_loads: bool,
    // Live file loads by (namespace, filename), only used when share_identical_loads is set
    shared_loads: DashMap<(ContentNamespace, String), LoadHandle, ahash::RandomState>,
    next_sequence: AtomicU64,
    shut_down: AtomicBool,
}

impl SchedulerShared {
    fn enqueue(
        &self,
        kind: OperationKind,
        namespace: &ContentNamespace,
        filename: &str,
        dependencies: &[ContentFile],
        fence: DependencyFence,
    ) -> ContentResult<Arc<OperationSlot>> {
        self.fences.validate(fence).map_err(|e| {
            log::warn!("Refused load of {}/{}: {}", namespace, filename, e);
            e
        })?;

        let mut dependency_slots = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let slot = self
                .registry
                .lookup_valid(dependency.0)
                .and_then(|slot| {
                    // Scenes can be unloaded without ever finishing, so nothing may wait on one
                    if slot.lock().kind.is_scene() {
                        Err(ContentError::InvalidHandle(dependency.0))
                    } else {
                        Ok(slot)
                    }
                })
                .map_err(|e| {
                    log::warn!(
                        "Refused load of {}/{}: dependency {:?} is not a valid file handle",
                        namespace,
                        filename,
                        dependency.0
                    );
                    e
                })?;
            dependency_slots.push(slot);
        }

        if kind.is_scene() || !self.share_identical_loads {
            let slot = self.create_operation(kind, namespace, filename, dependency_slots, fence);
            self.register_blockers(&slot);
            return Ok(slot);
        }

        // Holding the entry keeps two threads from starting the same file at once. Only the slot
        // is created under it, blockers are registered after the shard lock is released.
        let slot = match self
            .shared_loads
            .entry((namespace.clone(), filename.to_string()))
        {
            Entry::Occupied(mut occupied) => {
                if let Some(slot) = self.registry.lookup(*occupied.get()) {
                    let mut state = slot.lock();
                    if !state.released && state.phase() != OperationPhase::Failed {
                        state.ref_count += 1;
                        log::debug!(
                            "Sharing load {:?} of {}/{}, ref count {}",
                            slot.load_handle(),
                            namespace,
                            filename,
                            state.ref_count
                        );
                        drop(state);
                        return Ok(slot);
                    }
                }

                let slot = self.create_operation(kind, namespace, filename, dependency_slots, fence);
                occupied.insert(slot.load_handle());
                slot
            }
            Entry::Vacant(vacant) => {
                let slot = self.create_operation(kind, namespace, filename, dependency_slots, fence);
                vacant.insert(slot.load_handle());
                slot
            }
        };

        self.register_blockers(&slot);
        Ok(slot)
    }

    // Issues a handle for the operation. A load that is accepted holds one blocker per
    // dependency, one for the fence, and one until register_blockers is done with it.
    fn create_operation(
        &self,
        kind: OperationKind,
        namespace: &ContentNamespace,
        filename: &str,
        dependency_slots: Vec<Arc<OperationSlot>>,
        fence: DependencyFence,
    ) -> Arc<OperationSlot> {
        let dependencies = dependency_slots.iter().map(|x| x.load_handle()).collect();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut state = OperationState::new(
            kind,
            namespace.clone(),
            filename.to_string(),
            dependencies,
            fence,
            sequence,
        );

        if self.shut_down.load(Ordering::Acquire) {
            state.fail(LoadFailure::Shutdown);
            let slot = self.registry.issue(state);
            log::warn!(
                "Refused load {:?} of {}/{}, loader is shut down",
                slot.load_handle(),
                namespace,
                filename
            );
            return slot;
        }

        let max_queued_requests = self.max_queued_requests;
        let reserved = self
            .queued_request_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count < max_queued_requests {
                    Some(count + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !reserved {
            state.fail(LoadFailure::QueueOverflow);
            let slot = self.registry.issue(state);
            log::warn!(
                "Refused load {:?} of {}/{}, {} requests already queued",
                slot.load_handle(),
                namespace,
                filename,
                max_queued_requests
            );
            return slot;
        }

        let dependency_count = dependency_slots.len();
        state.counted_in_queue = true;
        state.blocking_dependency_count = dependency_count as u32 + 2;
        state.dependency_slots = dependency_slots;
        let slot = self.registry.issue(state);
        log::debug!(
            "Enqueued load {:?} of {}/{} with {} dependencies and fence {:?}",
            slot.load_handle(),
            namespace,
            filename,
            dependency_count,
            fence
        );
        slot
    }

    // Hooks the operation up to its dependencies and fence, then drops the blocker held by
    // create_operation so the last one to clear dispatches the load
    fn register_blockers(
        &self,
        slot: &Arc<OperationSlot>,
    ) {
        let (dependency_slots, fence) = {
            let state = slot.lock();
            if state.phase() != OperationPhase::InProgress {
                return;
            }
            (state.dependency_slots.clone(), state.fence)
        };

        for dependency in &dependency_slots {
            let dependency_phase = {
                let mut dependency_state = dependency.lock();
                let phase = dependency_state.phase();
                if !phase.is_terminal() {
                    dependency_state.blocked_loads.push(Arc::downgrade(slot));
                }
                phase
            };

            match dependency_phase {
                OperationPhase::Completed => self.release_blocker(slot, None),
                OperationPhase::Failed => {
                    self.release_blocker(slot, Some(dependency.load_handle()))
                }
                _ => log::trace!(
                    "Load {:?} waits on dependency {:?}",
                    slot.load_handle(),
                    dependency.load_handle()
                ),
            }
        }

        if self.fences.satisfied_or_wait(fence, Arc::downgrade(slot)) {
            self.release_blocker(slot, None);
        } else {
            log::trace!("Load {:?} waits on fence {:?}", slot.load_handle(), fence);
        }

        self.release_blocker(slot, None);
    }

    // Called when one thing the operation was waiting on cleared. The last one to clear either
    // dispatches the load to a worker or, if a dependency failed, fails it without loading.
    pub(crate) fn release_blocker(
        &self,
        slot: &Arc<OperationSlot>,
        failed_dependency: Option<LoadHandle>,
    ) {
        let mut state = slot.lock();
        if state.failed_dependency.is_none() {
            state.failed_dependency = failed_dependency;
        }

        debug_assert!(state.blocking_dependency_count > 0);
        state.blocking_dependency_count = state.blocking_dependency_count.saturating_sub(1);
        if state.blocking_dependency_count > 0 || state.phase() != OperationPhase::InProgress {
            return;
        }

        let failed_dependency = state.failed_dependency;
        drop(state);

        if let Some(failed_dependency) = failed_dependency {
            self.fail_operation(slot, LoadFailure::DependencyFailed(failed_dependency));
        } else {
            log::debug!("Dispatching load {:?}", slot.load_handle());
            self.dispatch(SchedulerRequest::Load(slot.clone()));
        }
    }

    pub(crate) fn release_fence_waiters(
        &self,
        waiters: Vec<Weak<OperationSlot>>,
    ) {
        for waiter in waiters {
            if let Some(slot) = waiter.upgrade() {
                self.release_blocker(&slot, None);
            }
        }
    }

    fn dispatch(
        &self,
        request: SchedulerRequest,
    ) {
        if !self.shut_down.load(Ordering::Acquire) {
            match self.request_tx.send(request) {
                Ok(()) => return,
                Err(e) => self.cancel_request(e.into_inner()),
            }
        } else {
            self.cancel_request(request);
        }
    }

    // Handles a request that no worker will pick up
    fn cancel_request(
        &self,
        request: SchedulerRequest,
    ) {
        match request {
            SchedulerRequest::Load(slot) => self.fail_operation(&slot, LoadFailure::Shutdown),
            SchedulerRequest::Teardown(slot) => self.run_teardown(&slot),
        }
    }

    fn leave_queue(
        &self,
        state: &mut OperationState,
    ) {
        if state.counted_in_queue {
            state.counted_in_queue = false;
            self.queued_request_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn fail_operation(
        &self,
        slot: &Arc<OperationSlot>,
        failure: LoadFailure,
    ) {
        let mut state = slot.lock();
        self.leave_queue(&mut state);
        if state.phase().is_terminal() {
            return;
        }

        log::error!(
            "Load {:?} of {}/{} failed: {}",
            slot.load_handle(),
            state.namespace,
            state.filename,
            failure
        );
        if state.fail(failure) {
            self.on_terminal(slot, state);
        }
    }

    pub(crate) fn complete_operation(
        &self,
        slot: &Arc<OperationSlot>,
    ) {
        let state = slot.lock();
        self.complete_locked(slot, state);
    }

    fn complete_locked(
        &self,
        slot: &Arc<OperationSlot>,
        mut state: MutexGuard<'_, OperationState>,
    ) {
        if state.advance(OperationPhase::Completed) {
            log::debug!(
                "Load {:?} of {}/{} completed",
                slot.load_handle(),
                state.namespace,
                state.filename
            );
            self.on_terminal(slot, state);
        }
    }

    // Wakes waiters and lets everything blocked on the operation continue. Takes the guard so the
    // lock is released before dependents are touched.
    fn on_terminal(
        &self,
        slot: &Arc<OperationSlot>,
        mut state: MutexGuard<'_, OperationState>,
    ) {
        let blocked_loads = std::mem::take(&mut state.blocked_loads);
        let failed = state.phase() == OperationPhase::Failed;
        let teardown = state.teardown_pending;
        state.teardown_pending = false;
        drop(state);
        slot.notify();

        let failed_dependency = if failed {
            Some(slot.load_handle())
        } else {
            None
        };
        for blocked_load in blocked_loads {
            if let Some(blocked_slot) = blocked_load.upgrade() {
                self.release_blocker(&blocked_slot, failed_dependency);
            }
        }

        if teardown {
            self.dispatch(SchedulerRequest::Teardown(slot.clone()));
        }
    }

    #[profiling::function]
    fn run_load(
        &self,
        slot: &Arc<OperationSlot>,
    ) {
        let (namespace, filename, dependency_slots) = {
            let mut state = slot.lock();
            self.leave_queue(&mut state);
            if state.phase() != OperationPhase::InProgress {
                return;
            }

            state.load_started = Some(Instant::now());
            (
                state.namespace.clone(),
                state.filename.clone(),
                state.dependency_slots.clone(),
            )
        };

        log::debug!(
            "Start load {:?} of {}/{}",
            slot.load_handle(),
            namespace,
            filename
        );
        match self.load_objects(&namespace, &filename, &dependency_slots) {
            Ok(objects) => self.publish_objects(slot, Arc::new(objects)),
            Err(failure) => self.fail_operation(slot, failure),
        }
    }

    fn load_objects(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        dependency_slots: &[Arc<OperationSlot>],
    ) -> Result<ObjectGraph, LoadFailure> {
        let data = {
            profiling::scope!("ContentStoreReader::read");
            self.store.read(namespace, filename)?
        };
        log::trace!("Read {} bytes from {}/{}", data.len(), namespace, filename);

        let objects = {
            profiling::scope!("ContentDeserializer::deserialize");
            self.deserializer.deserialize(&data)?
        };
        log::trace!("Deserialized {} objects from {}/{}", objects.len(), namespace, filename);

        resolve_references(&objects, dependency_slots)?;
        Ok(objects)
    }

    fn publish_objects(
        &self,
        slot: &Arc<OperationSlot>,
        objects: Arc<ObjectGraph>,
    ) {
        let mut state = slot.lock();
        state.objects = Some(objects);

        let auto_integrate = match &state.kind {
            OperationKind::File => None,
            OperationKind::Scene { parameters, .. } => Some(parameters.auto_integrate),
        };
        let auto_integrate = match auto_integrate {
            Some(auto_integrate) => auto_integrate,
            None => {
                self.complete_locked(slot, state);
                return;
            }
        };

        state.advance(OperationPhase::WaitingForIntegrate);
        let integrate = (auto_integrate || state.integrate_requested) && !state.released;
        if integrate {
            state.advance(OperationPhase::WillIntegrateNextFrame);
        }
        log::debug!(
            "Scene {:?} of {}/{} loaded, {:?}",
            slot.load_handle(),
            state.namespace,
            state.filename,
            state.phase()
        );
        drop(state);
        slot.notify();

        if integrate {
            self.integration_queue.push_integration(slot.clone());
        }
    }

    fn run_teardown(
        &self,
        slot: &Arc<OperationSlot>,
    ) {
        let (namespace, filename, completion) = {
            let mut state = slot.lock();
            state.dependency_slots.clear();
            (
                state.namespace.clone(),
                state.filename.clone(),
                state.unload_completion.take(),
            )
        };

        self.registry.retire(slot.load_handle());
        self.forget_shared_load(&namespace, &filename, slot.load_handle());
        log::debug!(
            "Unloaded {:?} of {}/{}",
            slot.load_handle(),
            namespace,
            filename
        );

        if let Some(completion) = completion {
            completion.complete();
        }
    }

    fn forget_shared_load(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        load_handle: LoadHandle,
    ) {
        if self.share_identical_loads {
            self.shared_loads
                .remove_if(&(namespace.clone(), filename.to_string()), |_, x| {
                    *x == load_handle
                });
        }
    }

    fn unload(
        &self,
        file: ContentFile,
    ) -> ContentResult<ContentFileUnloadHandle> {
        let slot = self.registry.lookup_valid(file.0).map_err(|e| {
            log::warn!("Unload of invalid handle {:?}", file.0);
            e
        })?;

        let mut state = slot.lock();
        if state.released || state.kind.is_scene() {
            log::warn!("Unload of invalid handle {:?}", file.0);
            return Err(ContentError::InvalidHandle(file.0));
        }

        state.ref_count -= 1;
        if state.ref_count > 0 {
            log::debug!(
                "Released reference to {:?}, ref count {}",
                file.0,
                state.ref_count
            );
            return Ok(ContentFileUnloadHandle::new(
                file.0,
                UnloadCompletion::completed(),
            ));
        }

        state.released = true;
        let completion = Arc::new(UnloadCompletion::default());
        state.unload_completion = Some(completion.clone());
        let teardown_now = state.phase().is_terminal();
        if !teardown_now {
            // on_terminal dispatches the teardown
            state.teardown_pending = true;
        }
        let namespace = state.namespace.clone();
        let filename = state.filename.clone();
        drop(state);

        log::debug!("Unloading {:?} of {}/{}", file.0, namespace, filename);
        self.forget_shared_load(&namespace, &filename, file.0);
        if teardown_now {
            self.dispatch(SchedulerRequest::Teardown(slot));
        }

        Ok(ContentFileUnloadHandle::new(file.0, completion))
    }
}

// Every reference must point at an object in this file or in the dependency it names
fn resolve_references(
    objects: &ObjectGraph,
    dependency_slots: &[Arc<OperationSlot>],
) -> Result<(), LoadFailure> {
    let dependency_objects: Vec<Option<Arc<ObjectGraph>>> = dependency_slots
        .iter()
        .map(|x| x.lock().objects.clone())
        .collect();

    for object in objects.objects() {
        for reference in &object.references {
            let resolved = match *reference {
                ObjectRef::Local(local_id) => objects.contains(local_id),
                ObjectRef::External {
                    dependency,
                    local_id,
                } => dependency_objects
                    .get(dependency as usize)
                    .and_then(|x| x.as_ref())
                    .map_or(false, |x| x.contains(local_id)),
            };

            if !resolved {
                return Err(LoadFailure::UnresolvedReference(
                    object.local_id,
                    *reference,
                ));
            }
        }
    }

    Ok(())
}

// Thread that tries to take jobs out of the request channel and ends when the finish channel is signalled
struct LoadWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl LoadWorkerThread {
    fn new(
        shared: Arc<SchedulerShared>,
        request_rx: Receiver<SchedulerRequest>,
        thread_index: usize,
    ) -> std::io::Result<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("Content Load Thread {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("LoadWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let request = match msg {
                                Ok(request) => request,
                                Err(_) => return,
                            };

                            shared.active_request_count.fetch_add(1, Ordering::AcqRel);
                            match request {
                                SchedulerRequest::Load(slot) => {
                                    profiling::scope!("SchedulerRequest::Load");
                                    shared.run_load(&slot);
                                }
                                SchedulerRequest::Teardown(slot) => {
                                    profiling::scope!("SchedulerRequest::Teardown");
                                    shared.run_teardown(&slot);
                                }
                            }
                            shared.active_request_count.fetch_sub(1, Ordering::AcqRel);
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(LoadWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

/// Owns the worker threads and decides when a load may start.
///
/// A load is dispatched to a worker once every dependency has completed and its fence is
/// satisfied. If any dependency fails, the load fails too without being attempted.
pub struct LoadScheduler {
    shared: Arc<SchedulerShared>,
    worker_threads: Mutex<Vec<LoadWorkerThread>>,
    request_rx: Receiver<SchedulerRequest>,
}

impl LoadScheduler {
    pub(crate) fn new(
        worker_count: usize,
        max_queued_requests: usize,
        share_identical_loads: bool,
        store: Box<dyn ContentStoreReader>,
        deserializer: Box<dyn ContentDeserializer>,
    ) -> ContentResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SchedulerShared {
            registry: HandleRegistry::default(),
            fences: FenceTable::default(),
            integration_queue: IntegrationQueue::default(),
            store,
            deserializer,
            request_tx,
            queued_request_count: AtomicUsize::new(0),
            active_request_count: AtomicUsize::new(0),
            max_queued_requests,
            share_identical_loads,
            shared_loads: DashMap::with_hasher(ahash::RandomState::default()),
            next_sequence: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        let mut worker_threads = Vec::with_capacity(worker_count);
        for thread_index in 0..worker_count {
            let worker = LoadWorkerThread::new(shared.clone(), request_rx.clone(), thread_index);
            match worker {
                Ok(worker) => worker_threads.push(worker),
                Err(e) => {
                    let scheduler = LoadScheduler {
                        shared,
                        worker_threads: Mutex::new(worker_threads),
                        request_rx,
                    };
                    scheduler.shutdown();
                    return Err(ContentError::ConfigurationError(format!(
                        "Failed to spawn load worker thread: {}",
                        e
                    )));
                }
            }
        }

        log::debug!("Started {} load worker threads", worker_count);
        Ok(LoadScheduler {
            shared,
            worker_threads: Mutex::new(worker_threads),
            request_rx,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.shared.registry
    }

    pub fn enqueue_file_load(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        dependencies: &[ContentFile],
        fence: DependencyFence,
    ) -> ContentResult<ContentFile> {
        let slot = self.shared.enqueue(
            OperationKind::File,
            namespace,
            filename,
            dependencies,
            fence,
        )?;
        Ok(ContentFile(slot.load_handle()))
    }

    pub fn enqueue_scene_load(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        scene_name: &str,
        parameters: ContentSceneParameters,
        dependencies: &[ContentFile],
        fence: DependencyFence,
    ) -> ContentResult<ContentSceneFile> {
        let kind = OperationKind::Scene {
            scene_name: scene_name.to_string(),
            parameters,
        };
        let slot = self
            .shared
            .enqueue(kind, namespace, filename, dependencies, fence)?;
        Ok(ContentSceneFile(slot.load_handle()))
    }

    /// Drops one reference to the file. At zero the handle becomes invalid and the entry is torn
    /// down once the load is no longer in flight.
    pub fn enqueue_unload(
        &self,
        file: ContentFile,
    ) -> ContentResult<ContentFileUnloadHandle> {
        self.shared.unload(file)
    }

    pub fn issue_fence(&self) -> DependencyFence {
        self.shared.fences.issue()
    }

    pub fn complete_fence(
        &self,
        fence: DependencyFence,
    ) -> ContentResult<()> {
        let waiters = self.shared.fences.complete(fence)?;
        self.shared.release_fence_waiters(waiters);
        Ok(())
    }

    pub fn signal_global_table_ready(&self) -> ContentResult<()> {
        let waiters = self.shared.fences.signal_global_table_ready()?;
        self.shared.release_fence_waiters(waiters);
        Ok(())
    }

    pub fn is_fence_satisfied(
        &self,
        fence: DependencyFence,
    ) -> bool {
        self.shared.fences.is_satisfied(fence)
    }

    /// Loads that were accepted but not yet picked up by a worker
    pub fn queued_request_count(&self) -> usize {
        self.shared.queued_request_count.load(Ordering::Acquire)
    }

    /// Requests a worker is processing right now
    pub fn active_request_count(&self) -> usize {
        self.shared.active_request_count.load(Ordering::Acquire)
    }

    /// Stops and joins the worker threads. Loads that did not finish are failed with
    /// `LoadFailure::Shutdown`. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        let worker_threads = std::mem::take(&mut *self.worker_threads.lock());
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for worker_thread in &worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("A load worker thread panicked");
            }
        }

        while let Ok(request) = self.request_rx.try_recv() {
            self.shared.cancel_request(request);
        }

        // Loads still waiting on dependencies or fences will never be dispatched
        for slot in self.shared.registry.slots() {
            let in_progress = slot.lock().phase() == OperationPhase::InProgress;
            if in_progress {
                self.shared.fail_operation(&slot, LoadFailure::Shutdown);
            }
        }

        log::debug!("Load scheduler shut down");
    }
}

impl Drop for LoadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
