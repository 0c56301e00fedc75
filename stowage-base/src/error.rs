use std::sync::Arc;

use crate::handle::LoadHandle;
use crate::object_graph::{LocalId, ObjectRef};

/// Produced by a deserializer when bytes read from the content store are not a valid object graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    message: String,
}

impl FormatError {
    pub fn new(message: impl Into<String>) -> Self {
        FormatError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for FormatError {}

impl core::fmt::Display for FormatError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        fmt.write_str(&self.message)
    }
}

/// Produced by the scene host when grafting loaded objects into the live scene graph fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationError {
    message: String,
}

impl IntegrationError {
    pub fn new(message: impl Into<String>) -> Self {
        IntegrationError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for IntegrationError {}

impl core::fmt::Display for IntegrationError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        fmt.write_str(&self.message)
    }
}

/// Why an operation ended up `Failed`. Recorded on the operation by the worker or integration
/// pass that failed it, and handed back to the caller when they inspect the operation.
#[derive(Debug, Clone)]
pub enum LoadFailure {
    // Reading from the content store failed (missing file, bad path, ...)
    Io(Arc<std::io::Error>),
    // The deserializer rejected the data
    Format(FormatError),
    // A dependency failed, so this operation was failed without attempting the load
    DependencyFailed(LoadHandle),
    // An object references something that doesn't exist in this file or its dependencies
    UnresolvedReference(LocalId, ObjectRef),
    // The scene host could not graft the scene
    Integration(IntegrationError),
    // The scheduler queue was full when the request was made
    QueueOverflow,
    // The loader shut down before a worker picked up the request
    Shutdown,
}

impl std::error::Error for LoadFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadFailure::Io(ref e) => Some(&**e),
            LoadFailure::Format(ref e) => Some(e),
            LoadFailure::Integration(ref e) => Some(e),
            LoadFailure::DependencyFailed(_) => None,
            LoadFailure::UnresolvedReference(_, _) => None,
            LoadFailure::QueueOverflow => None,
            LoadFailure::Shutdown => None,
        }
    }
}

impl core::fmt::Display for LoadFailure {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            LoadFailure::Io(ref e) => write!(fmt, "IO error: {}", e),
            LoadFailure::Format(ref e) => write!(fmt, "Format error: {}", e),
            LoadFailure::DependencyFailed(handle) => {
                write!(fmt, "Dependency {:?} failed to load", handle)
            }
            LoadFailure::UnresolvedReference(local_id, reference) => write!(
                fmt,
                "Object {:?} has unresolved reference {:?}",
                local_id, reference
            ),
            LoadFailure::Integration(ref e) => write!(fmt, "Integration error: {}", e),
            LoadFailure::QueueOverflow => fmt.write_str("QueueOverflow"),
            LoadFailure::Shutdown => fmt.write_str("Loader shut down before the request ran"),
        }
    }
}

impl From<std::io::Error> for LoadFailure {
    fn from(error: std::io::Error) -> Self {
        LoadFailure::Io(Arc::new(error))
    }
}

impl From<FormatError> for LoadFailure {
    fn from(error: FormatError) -> Self {
        LoadFailure::Format(error)
    }
}

impl From<IntegrationError> for LoadFailure {
    fn from(error: IntegrationError) -> Self {
        LoadFailure::Integration(error)
    }
}

/// Errors returned synchronously from every public loader call
#[derive(Debug, Clone)]
pub enum ContentError {
    // The handle is unknown, null, or has been unloaded
    InvalidHandle(LoadHandle),
    // Data was requested before the operation reached a state where it is available
    NotYetComplete(LoadHandle),
    // The operation is permanently failed
    OperationFailed(LoadFailure),
    // The requested object isn't in the completed object graph
    NotFound(LocalId),
    ConfigurationError(String),
    // The scheduler refused the request because too many were already queued
    QueueOverflow,
}

impl std::error::Error for ContentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            ContentError::OperationFailed(ref e) => Some(e),
            _ => None,
        }
    }
}

impl core::fmt::Display for ContentError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            ContentError::InvalidHandle(handle) => write!(fmt, "Invalid handle {:?}", handle),
            ContentError::NotYetComplete(handle) => {
                write!(fmt, "Operation {:?} has not completed yet", handle)
            }
            ContentError::OperationFailed(ref e) => write!(fmt, "Operation failed: {}", e),
            ContentError::NotFound(local_id) => write!(fmt, "Object {:?} not found", local_id),
            ContentError::ConfigurationError(ref e) => fmt.write_str(e),
            ContentError::QueueOverflow => fmt.write_str("QueueOverflow"),
        }
    }
}

impl From<LoadFailure> for ContentError {
    fn from(failure: LoadFailure) -> Self {
        match failure {
            LoadFailure::QueueOverflow => ContentError::QueueOverflow,
            failure => ContentError::OperationFailed(failure),
        }
    }
}

pub type ContentResult<T> = Result<T, ContentError>;
