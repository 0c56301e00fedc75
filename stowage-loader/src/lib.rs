mod bincode_format;
mod config;
mod disk_io;
mod fence_table;
mod integration;
mod operation;
mod ram_store;
mod registry;
mod scheduler;
pub mod storage;

#[cfg(test)]
mod tests;

pub use crate::bincode_format::{serialize_object_graph, BincodeDeserializer};
pub use crate::config::LoaderConfig;
pub use crate::disk_io::DiskContentStore;
pub use crate::integration::{IntegrationGate, IntegrationPassStats};
pub use crate::operation::ContentFileUnloadHandle;
pub use crate::ram_store::RamContentStore;
pub use crate::registry::HandleRegistry;
pub use crate::scheduler::LoadScheduler;
pub use crate::storage::{ContentDeserializer, ContentStoreReader, SceneHost, SceneInstantiateInfo};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stowage_base::{
    ContentError, ContentFile, ContentLoadProvider, ContentNamespace, ContentObject,
    ContentResult, ContentSceneFile, ContentSceneParameters, DependencyFence, LoadFailure,
    LoadHandle, LoadingStatus, LocalId, ObjectGraph, SceneHandle, SceneLoadingStatus,
};

use crate::operation::{OperationKind, OperationPhase};

/// Information about a load operation, for debugging and tooling
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub load_handle: LoadHandle,
    pub namespace: ContentNamespace,
    pub filename: String,
    /// Set for scene loads
    pub scene_name: Option<String>,
    pub loading_status: LoadingStatus,
    /// Set for scene loads
    pub scene_loading_status: Option<SceneLoadingStatus>,
    pub ref_count: u32,
    pub dependencies: Vec<LoadHandle>,
    pub fence: DependencyFence,
    /// Number of objects, once the data is loaded
    pub object_count: Option<usize>,
    /// Time a worker spent reading and deserializing the file
    pub load_duration: Option<Duration>,
    pub failure: Option<LoadFailure>,
    /// True if the handle was unloaded and the entry is waiting to be torn down
    pub released: bool,
}

//
// The ContentLoader is the public interface of the loader. It owns the scheduler (and so the
// worker threads) and the integration gate. All methods take &self, so it can be shared between
// threads behind an Arc.
//
pub struct ContentLoader {
    // Declared first so the workers are joined before anything else is dropped
    scheduler: LoadScheduler,
    integration_gate: IntegrationGate,
}

impl ContentLoader {
    pub fn new(
        config: LoaderConfig,
        store: Box<dyn ContentStoreReader>,
        deserializer: Box<dyn ContentDeserializer>,
    ) -> ContentResult<Self> {
        config.validate()?;
        let scheduler = LoadScheduler::new(
            config.worker_count,
            config.max_queued_requests,
            config.share_identical_loads,
            store,
            deserializer,
        )?;
        let integration_gate =
            IntegrationGate::new(scheduler.shared().clone(), config.integration_time_ms)?;

        log::debug!("Created content loader {:?}", config);
        Ok(ContentLoader {
            scheduler,
            integration_gate,
        })
    }

    /// Loader reading bincode content from `<root>/<namespace>/<filename>`
    pub fn with_disk_store(
        config: LoaderConfig,
        root_path: impl Into<PathBuf>,
    ) -> ContentResult<Self> {
        let root_path = root_path.into();
        let store = DiskContentStore::open(root_path.clone()).ok_or_else(|| {
            ContentError::ConfigurationError(format!(
                "Content root {:?} is not a directory",
                root_path
            ))
        })?;
        Self::new(config, Box::new(store), Box::new(BincodeDeserializer))
    }

    pub fn scheduler(&self) -> &LoadScheduler {
        &self.scheduler
    }

    pub fn integration_gate(&self) -> &IntegrationGate {
        &self.integration_gate
    }

    pub fn registry(&self) -> &HandleRegistry {
        self.scheduler.registry()
    }

    /// Starts loading a file on a worker thread once every dependency completed and the fence is
    /// satisfied. Fails immediately only if a dependency handle is invalid or the fence was never
    /// issued. Everything else, including backpressure, is reported through the returned handle.
    pub fn load_file_async(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        dependencies: &[ContentFile],
        fence: DependencyFence,
    ) -> ContentResult<ContentFile> {
        self.scheduler
            .enqueue_file_load(namespace, filename, dependencies, fence)
    }

    /// Like [`load_file_async`](Self::load_file_async), but the loaded objects are grafted into
    /// the live scene graph by an integration pass.
    pub fn load_scene_async(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        scene_name: &str,
        parameters: ContentSceneParameters,
        dependencies: &[ContentFile],
        fence: DependencyFence,
    ) -> ContentResult<ContentSceneFile> {
        self.scheduler.enqueue_scene_load(
            namespace,
            filename,
            scene_name,
            parameters,
            dependencies,
            fence,
        )
    }

    pub fn unload_async(
        &self,
        file: ContentFile,
    ) -> ContentResult<ContentFileUnloadHandle> {
        self.scheduler.enqueue_unload(file)
    }

    pub fn issue_fence(&self) -> DependencyFence {
        self.scheduler.issue_fence()
    }

    pub fn complete_fence(
        &self,
        fence: DependencyFence,
    ) -> ContentResult<()> {
        self.scheduler.complete_fence(fence)
    }

    pub fn signal_global_table_ready(&self) -> ContentResult<()> {
        self.scheduler.signal_global_table_ready()
    }

    pub fn is_fence_satisfied(
        &self,
        fence: DependencyFence,
    ) -> bool {
        self.scheduler.is_fence_satisfied(fence)
    }

    pub fn integration_time_ms(&self) -> f32 {
        self.integration_gate.integration_time_ms()
    }

    pub fn set_integration_time_ms(
        &self,
        integration_time_ms: f32,
    ) -> ContentResult<()> {
        self.integration_gate
            .set_integration_time_ms(integration_time_ms)
    }

    /// Call once per frame from the thread that owns the scene graph
    pub fn run_integration_pass(
        &self,
        host: &mut dyn SceneHost,
    ) -> IntegrationPassStats {
        self.integration_gate.run_pass(host)
    }

    pub fn queued_request_count(&self) -> usize {
        self.scheduler.queued_request_count()
    }

    pub fn active_request_count(&self) -> usize {
        self.scheduler.active_request_count()
    }

    /// Handles of operations that have not reached a terminal state, in the order they were issued
    pub fn active_loads(&self) -> Vec<LoadHandle> {
        let mut loading_handles: Vec<_> = self
            .registry()
            .slots()
            .into_iter()
            .filter(|x| !x.lock().phase().is_terminal())
            .map(|x| x.load_handle())
            .collect();
        loading_handles.sort();
        loading_handles
    }

    pub fn load_info(
        &self,
        load_handle: LoadHandle,
    ) -> Option<LoadInfo> {
        let slot = self.registry().lookup(load_handle)?;
        let state = slot.lock();
        let (scene_name, scene_loading_status) = match &state.kind {
            OperationKind::File => (None, None),
            OperationKind::Scene { scene_name, .. } => (
                Some(scene_name.clone()),
                Some(state.phase().scene_loading_status()),
            ),
        };

        Some(LoadInfo {
            load_handle,
            namespace: state.namespace.clone(),
            filename: state.filename.clone(),
            scene_name,
            loading_status: state.phase().loading_status(),
            scene_loading_status,
            ref_count: state.ref_count,
            dependencies: state.dependencies.clone(),
            fence: state.fence,
            object_count: state.objects.as_ref().map(|x| x.len()),
            load_duration: state.load_duration(),
            failure: state.failure.clone(),
            released: state.released,
        })
    }

    fn live_handles(
        &self,
        namespace: &ContentNamespace,
        scenes: bool,
    ) -> Vec<LoadHandle> {
        let mut handles: Vec<_> = self
            .registry()
            .slots()
            .into_iter()
            .filter(|x| {
                let state = x.lock();
                !state.released && state.kind.is_scene() == scenes && state.namespace == *namespace
            })
            .map(|x| x.load_handle())
            .collect();
        handles.sort();
        handles
    }

    /// Valid file handles in the namespace, whatever their status
    pub fn loaded_files(
        &self,
        namespace: &ContentNamespace,
    ) -> Vec<ContentFile> {
        self.live_handles(namespace, false)
            .into_iter()
            .map(ContentFile)
            .collect()
    }

    /// Valid scene handles in the namespace, whatever their status
    pub fn loaded_scenes(
        &self,
        namespace: &ContentNamespace,
    ) -> Vec<ContentSceneFile> {
        self.live_handles(namespace, true)
            .into_iter()
            .map(ContentSceneFile)
            .collect()
    }

    /// Stops the worker threads. Loads that did not finish fail with `LoadFailure::Shutdown`, and
    /// loads requested afterwards fail the same way. Also happens when the loader is dropped.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

//
// This impl lets the handles in stowage_base answer questions about themselves by proxying the
// call to this loader
//
impl ContentLoadProvider for ContentLoader {
    fn is_valid(
        &self,
        load_handle: LoadHandle,
    ) -> bool {
        self.registry().is_valid(load_handle)
    }

    fn loading_status(
        &self,
        file: ContentFile,
    ) -> ContentResult<LoadingStatus> {
        let slot = self.registry().lookup_valid(file.0)?;
        let phase = slot.lock().phase();
        Ok(phase.loading_status())
    }

    fn scene_loading_status(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<SceneLoadingStatus> {
        let slot = self.registry().lookup_valid(scene_file.0)?;
        let state = slot.lock();
        if !state.kind.is_scene() {
            log::warn!("{:?} is not a scene load", scene_file.0);
            return Err(ContentError::InvalidHandle(scene_file.0));
        }

        Ok(state.phase().scene_loading_status())
    }

    fn wait_for_completion(
        &self,
        load_handle: LoadHandle,
        timeout_ms: u64,
    ) -> ContentResult<bool> {
        let slot = self.registry().lookup_valid(load_handle)?;
        profiling::scope!("wait_for_completion");
        Ok(slot.wait_until_settled(Duration::from_millis(timeout_ms)))
    }

    fn objects(
        &self,
        file: ContentFile,
    ) -> ContentResult<Arc<ObjectGraph>> {
        let slot = self.registry().lookup_valid(file.0)?;
        let state = slot.lock();
        match (state.phase(), &state.objects) {
            (OperationPhase::Completed, Some(objects)) => Ok(objects.clone()),
            (OperationPhase::Failed, _) => Err(state.failure_error(file.0)),
            _ => Err(ContentError::NotYetComplete(file.0)),
        }
    }

    fn object(
        &self,
        file: ContentFile,
        local_id: LocalId,
    ) -> ContentResult<Arc<ContentObject>> {
        self.objects(file)?
            .get(local_id)
            .cloned()
            .ok_or(ContentError::NotFound(local_id))
    }

    fn scene(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<SceneHandle> {
        let slot = self.registry().lookup_valid(scene_file.0)?;
        let state = slot.lock();
        match (state.phase(), state.scene) {
            (OperationPhase::Completed, Some(scene)) => Ok(scene),
            (OperationPhase::Failed, _) => Err(state.failure_error(scene_file.0)),
            _ => Err(ContentError::NotYetComplete(scene_file.0)),
        }
    }

    fn integrate_at_end_of_frame(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()> {
        self.integration_gate.request_integration(scene_file)
    }

    fn unload_at_end_of_frame(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()> {
        self.integration_gate.request_unload(scene_file)
    }
}
