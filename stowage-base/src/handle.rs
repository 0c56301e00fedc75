use std::fmt::Debug;
use std::sync::Arc;

use crate::error::ContentResult;
use crate::object_graph::{ContentObject, LocalId, ObjectGraph, SceneHandle};
use crate::status::{LoadingStatus, SceneLoadingStatus};

/// Loading ID allocated by the loader's handle registry to track a single load operation.
///
/// IDs increase monotonically for the lifetime of a registry and are never handed out twice, so a
/// handle that outlives its operation can never alias a newer one. Zero is the null handle.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd, Default)]
pub struct LoadHandle(pub u64);

impl LoadHandle {
    pub const fn null() -> Self {
        LoadHandle(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Handle to a file's object graph that was requested through the loader.
///
/// This is only a lookup key. The loader owns the operation it refers to, and every call through
/// the handle fails with `InvalidHandle` once the file has been unloaded.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Default)]
pub struct ContentFile(pub LoadHandle);

/// Handle to a scene load. Like [`ContentFile`] but with the extra integration step.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Default)]
pub struct ContentSceneFile(pub LoadHandle);

impl From<ContentFile> for LoadHandle {
    fn from(file: ContentFile) -> Self {
        file.0
    }
}

impl From<ContentSceneFile> for LoadHandle {
    fn from(scene_file: ContentSceneFile) -> Self {
        scene_file.0
    }
}

// This allows handles in stowage_base to answer questions about themselves while the state lives
// in the loader (or some other loader implementation)
pub trait ContentLoadProvider {
    fn is_valid(
        &self,
        load_handle: LoadHandle,
    ) -> bool;

    fn loading_status(
        &self,
        file: ContentFile,
    ) -> ContentResult<LoadingStatus>;

    fn scene_loading_status(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<SceneLoadingStatus>;

    /// Blocks until the operation can make no further progress on its own, or the timeout elapses.
    /// Returns true if the operation got there. Check the status afterwards to see whether it
    /// succeeded.
    fn wait_for_completion(
        &self,
        load_handle: LoadHandle,
        timeout_ms: u64,
    ) -> ContentResult<bool>;

    fn objects(
        &self,
        file: ContentFile,
    ) -> ContentResult<Arc<ObjectGraph>>;

    fn object(
        &self,
        file: ContentFile,
        local_id: LocalId,
    ) -> ContentResult<Arc<ContentObject>>;

    fn scene(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<SceneHandle>;

    fn integrate_at_end_of_frame(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()>;

    fn unload_at_end_of_frame(
        &self,
        scene_file: ContentSceneFile,
    ) -> ContentResult<()>;
}

impl ContentFile {
    pub const INVALID: ContentFile = ContentFile(LoadHandle::null());

    pub fn load_handle(&self) -> LoadHandle {
        self.0
    }

    pub fn is_valid(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> bool {
        provider.is_valid(self.0)
    }

    pub fn loading_status(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<LoadingStatus> {
        provider.loading_status(*self)
    }

    pub fn wait_for_completion(
        &self,
        provider: &impl ContentLoadProvider,
        timeout_ms: u64,
    ) -> ContentResult<bool> {
        provider.wait_for_completion(self.0, timeout_ms)
    }

    pub fn objects(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<Arc<ObjectGraph>> {
        provider.objects(*self)
    }

    pub fn object(
        &self,
        provider: &impl ContentLoadProvider,
        local_id: LocalId,
    ) -> ContentResult<Arc<ContentObject>> {
        provider.object(*self, local_id)
    }
}

impl ContentSceneFile {
    pub const INVALID: ContentSceneFile = ContentSceneFile(LoadHandle::null());

    pub fn load_handle(&self) -> LoadHandle {
        self.0
    }

    pub fn is_valid(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> bool {
        provider.is_valid(self.0)
    }

    pub fn status(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<SceneLoadingStatus> {
        provider.scene_loading_status(*self)
    }

    pub fn wait_for_completion(
        &self,
        provider: &impl ContentLoadProvider,
        timeout_ms: u64,
    ) -> ContentResult<bool> {
        provider.wait_for_completion(self.0, timeout_ms)
    }

    /// The live scene this file was grafted into. Only available once the scene is `Complete`.
    pub fn scene(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<SceneHandle> {
        provider.scene(*self)
    }

    pub fn integrate_at_end_of_frame(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<()> {
        provider.integrate_at_end_of_frame(*self)
    }

    pub fn unload_at_end_of_frame(
        &self,
        provider: &impl ContentLoadProvider,
    ) -> ContentResult<()> {
        provider.unload_at_end_of_frame(*self)
    }
}
