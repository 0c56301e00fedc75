use serde::{Deserialize, Serialize};

/// Status of a file load. `Completed` and `Failed` are terminal.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum LoadingStatus {
    InProgress,
    Completed,
    Failed,
}

impl LoadingStatus {
    pub fn is_terminal(&self) -> bool {
        *self != LoadingStatus::InProgress
    }
}

/// Status of a scene load. `Complete` and `Failed` are terminal.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum SceneLoadingStatus {
    // Reading and deserializing
    InProgress,
    // Object data is loaded but nothing has been grafted into the live scene graph
    WaitingForIntegrate,
    // Queued for the next integration pass
    WillIntegrateNextFrame,
    Complete,
    Failed,
}

impl SceneLoadingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SceneLoadingStatus::Complete | SceneLoadingStatus::Failed
        )
    }

    /// True once worker threads are done with the scene and only the integration pass (or the
    /// caller) can move it further.
    pub fn is_gated_or_terminal(&self) -> bool {
        *self != SceneLoadingStatus::InProgress
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum LoadSceneMode {
    /// Replaces whatever scenes the host currently has loaded
    Single,
    /// Adds the scene next to the scenes the host already has loaded
    Additive,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum LocalPhysicsMode {
    /// The scene shares the host's default physics world
    None,
    /// The scene gets its own 2D physics world
    Physics2D,
    /// The scene gets its own 3D physics world
    Physics3D,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub struct ContentSceneParameters {
    pub load_scene_mode: LoadSceneMode,
    pub local_physics_mode: LocalPhysicsMode,
    /// If true, the scene is queued for integration as soon as its data is loaded. Otherwise it
    /// waits for an explicit `integrate_at_end_of_frame` call.
    pub auto_integrate: bool,
}

impl Default for ContentSceneParameters {
    fn default() -> Self {
        ContentSceneParameters {
            load_scene_mode: LoadSceneMode::Additive,
            local_physics_mode: LocalPhysicsMode::None,
            auto_integrate: true,
        }
    }
}
