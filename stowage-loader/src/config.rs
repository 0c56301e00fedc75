use serde::{Deserialize, Serialize};
use std::path::Path;
use stowage_base::{ContentError, ContentResult};

/// Settings for a [`ContentLoader`](crate::ContentLoader). Missing fields in serialized configs
/// take their default values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Number of worker threads reading and deserializing content
    pub worker_count: usize,
    /// Loads that may be waiting on dependencies or a worker before new requests are refused
    pub max_queued_requests: usize,
    /// Time budget for one integration pass, in milliseconds
    pub integration_time_ms: f32,
    /// If true, loading a file that is already loaded (same namespace and filename) returns the
    /// existing handle and adds a reference to it instead of loading the file again
    pub share_identical_loads: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            worker_count: 4,
            max_queued_requests: 1024,
            integration_time_ms: 2.0,
            share_identical_loads: false,
        }
    }
}

// One pass per frame, so anything longer than this is a mistake
pub(crate) const MAX_INTEGRATION_TIME_MS: f32 = 60_000.0;

pub(crate) fn validate_integration_time_ms(integration_time_ms: f32) -> ContentResult<()> {
    // Also rejects NaN
    if !(integration_time_ms > 0.0 && integration_time_ms <= MAX_INTEGRATION_TIME_MS) {
        return Err(ContentError::ConfigurationError(format!(
            "Integration time must be between 0 and {} milliseconds, got {}",
            MAX_INTEGRATION_TIME_MS, integration_time_ms
        )));
    }

    Ok(())
}

impl LoaderConfig {
    pub fn validate(&self) -> ContentResult<()> {
        if self.worker_count == 0 {
            return Err(ContentError::ConfigurationError(
                "worker_count must be at least 1".to_string(),
            ));
        }

        if self.max_queued_requests == 0 {
            return Err(ContentError::ConfigurationError(
                "max_queued_requests must be at least 1".to_string(),
            ));
        }

        validate_integration_time_ms(self.integration_time_ms)
    }

    pub fn from_json_str(json: &str) -> ContentResult<Self> {
        let config: LoaderConfig = serde_json::from_str(json).map_err(|e| {
            ContentError::ConfigurationError(format!("Failed to parse loader config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> ContentResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ContentError::ConfigurationError(format!(
                "Failed to read loader config {:?}: {}",
                path, e
            ))
        })?;
        Self::from_json_str(&json)
    }
}
