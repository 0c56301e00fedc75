/// A token gating the start of a load until some other asynchronous unit of work has finished.
///
/// A fence is a snapshot of the generation that was issued for that work. Load operations only
/// compare it against the loader's fence table; they never own or mutate it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct DependencyFence {
    generation: u64,
}

impl DependencyFence {
    /// Always satisfied
    pub const NONE: DependencyFence = DependencyFence { generation: 0 };

    /// Satisfied once the engine-wide reference resolution table is ready. That happens exactly
    /// once per loader.
    pub const GLOBAL_TABLE: DependencyFence = DependencyFence {
        generation: u64::MAX,
    };

    pub fn from_generation(generation: u64) -> Self {
        DependencyFence { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_global_table(&self) -> bool {
        *self == Self::GLOBAL_TABLE
    }
}

impl Default for DependencyFence {
    fn default() -> Self {
        Self::NONE
    }
}
