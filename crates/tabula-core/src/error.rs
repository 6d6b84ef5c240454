/// Core error types for Tabula.
use crate::handle::{ContextId, ResourceId, ResourceKind};

/// A specialized Result type for Tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

/// Top-level error type encompassing the registry, workers, coordinator and devices.
#[derive(Debug, thiserror::Error)]
pub enum TabulaError {
    #[error("resource {id} not found in registry")]
    NotFound { id: ResourceId },

    #[error("resource {id} is a {found}, expected {expected}")]
    TypeMismatch {
        id: ResourceId,
        expected: &'static str,
        found: ResourceKind,
    },

    #[error("resource {id} is sealed and cannot be overwritten")]
    Sealed { id: ResourceId },

    #[error("resource {id} was already published")]
    AlreadyPublished { id: ResourceId },

    #[error("resource {id} is owned by {owner}, write attempted by {writer}")]
    WriterConflict {
        id: ResourceId,
        owner: ContextId,
        writer: ContextId,
    },

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("worker {index} failed: {message}")]
    Worker { index: usize, message: String },

    #[error("barrier timed out in cycle {cycle}: {completed}/{expected} workers done")]
    BarrierTimeout {
        cycle: u64,
        completed: usize,
        expected: usize,
    },

    #[error("stale artifact for resource {id}: expected generation {expected}, found {found}")]
    StaleArtifact {
        id: ResourceId,
        expected: u64,
        found: u64,
    },

    #[error("worker channel closed")]
    ChannelClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

impl TabulaError {
    /// Create a worker failure for the worker at `index`.
    pub fn worker(index: usize, message: impl Into<String>) -> Self {
        TabulaError::Worker {
            index,
            message: message.into(),
        }
    }

    /// Create a device error.
    pub fn device(message: impl Into<String>) -> Self {
        TabulaError::Device(message.into())
    }

    /// True for errors raised by a registry lookup that found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TabulaError::NotFound { .. })
    }
}

impl From<toml::de::Error> for TabulaError {
    fn from(err: toml::de::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TabulaError {
    fn from(err: toml::ser::Error) -> Self {
        TabulaError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = TabulaError::NotFound {
            id: ResourceId::new(7),
        };
        assert_eq!(err.to_string(), "resource #7 not found in registry");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_writer_conflict_display() {
        let err = TabulaError::WriterConflict {
            id: ResourceId::new(10),
            owner: ContextId::worker(0),
            writer: ContextId::worker(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("#10"));
        assert!(msg.contains("worker-0"));
        assert!(msg.contains("worker-1"));
    }

    #[test]
    fn test_worker_error_display() {
        let err = TabulaError::worker(3, "encoder lost");
        assert_eq!(err.to_string(), "worker 3 failed: encoder lost");
        assert!(!err.is_not_found());
    }
}
