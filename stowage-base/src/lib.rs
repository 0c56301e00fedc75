pub mod hashing;

mod error;
mod fence;
pub mod handle;
mod namespace;
mod object_graph;
mod status;

pub use error::{ContentError, ContentResult, FormatError, IntegrationError, LoadFailure};
pub use fence::DependencyFence;
pub use handle::{ContentFile, ContentLoadProvider, ContentSceneFile, LoadHandle};
pub use namespace::ContentNamespace;
pub use object_graph::{ContentObject, LocalId, ObjectGraph, ObjectRef, ObjectTypeId, SceneHandle};
pub use status::{
    ContentSceneParameters, LoadSceneMode, LoadingStatus, LocalPhysicsMode, SceneLoadingStatus,
};
