use std::sync::Arc;
use stowage_base::{
    ContentNamespace, ContentSceneParameters, FormatError, IntegrationError, ObjectGraph,
    SceneHandle,
};

/// Source of raw file bytes. Called from worker threads, possibly several at once.
pub trait ContentStoreReader: Send + Sync {
    fn read(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> std::io::Result<Vec<u8>>;
}

impl<T: ContentStoreReader + ?Sized> ContentStoreReader for Arc<T> {
    fn read(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> std::io::Result<Vec<u8>> {
        (**self).read(namespace, filename)
    }
}

/// Turns raw file bytes into an object graph. Called from worker threads.
pub trait ContentDeserializer: Send + Sync {
    fn deserialize(
        &self,
        data: &[u8],
    ) -> Result<ObjectGraph, FormatError>;
}

/// Describes the scene being grafted, passed to [`SceneHost::instantiate`]
#[derive(Debug)]
pub struct SceneInstantiateInfo<'a> {
    pub namespace: &'a ContentNamespace,
    pub filename: &'a str,
    pub scene_name: &'a str,
    pub parameters: ContentSceneParameters,
}

/// The engine's live scene graph. Only ever touched from the thread running the integration pass,
/// and only for the duration of that pass.
pub trait SceneHost {
    /// Creates a scene populated from the loaded objects. The scene must not be visible yet.
    fn instantiate(
        &mut self,
        objects: &ObjectGraph,
        info: &SceneInstantiateInfo,
    ) -> Result<SceneHandle, IntegrationError>;

    /// Makes an instantiated scene part of the live scene graph
    fn attach(
        &mut self,
        scene: SceneHandle,
    ) -> Result<(), IntegrationError>;

    /// Removes an attached scene from the live scene graph and destroys it
    fn detach(
        &mut self,
        scene: SceneHandle,
    );

    /// Destroys a scene that was instantiated but could not be attached
    fn discard(
        &mut self,
        _scene: SceneHandle,
    ) {
    }
}
