use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::{AccessClass, DriverError, Storage};
use crate::import::ImageError;

/// Error raised by a pipeline step.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A driver call failed; `context` names the operation.
    #[error("{context}: {source}")]
    Driver {
        context: String,
        #[source]
        source: DriverError,
    },

    /// An earlier step did not produce a value this step needs.
    #[error("Missing pipeline state: {0}")]
    MissingState(&'static str),

    #[error("No {access} IP address available to connect to")]
    NoMatchingAddress { access: AccessClass },

    #[error("Checksum mismatch after upload: expected '{expected}', got '{actual}'")]
    ChecksumMismatch { expected: String, actual: String },

    /// Some fan-out tasks failed while others succeeded.
    #[error("{operation} failed in {} of {total} zones: {}", failures.len(), failures.join("; "))]
    PartialFailure {
        operation: &'static str,
        total: usize,
        failures: Vec<String>,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("SSH key error: {0}")]
    SshKey(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Step '{0}' halted without reporting an error")]
    Halted(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Wrap a driver error with the operation that failed. Cancellation is
    /// reported as [`PipelineError::Cancelled`].
    pub fn driver(context: impl Into<String>, source: DriverError) -> Self {
        match source {
            source if source.is_cancelled() => PipelineError::Cancelled,
            source => PipelineError::Driver {
                context: context.into(),
                source,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Driver { source, .. } if source.is_timeout())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// Terminal result of a failed run: the first fatal error plus every
/// error raised while compensating.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub cleanup_errors: Vec<PipelineError>,
    /// Templates the run finished before failing. They still exist.
    pub retained_templates: Vec<Storage>,
}

impl PipelineFailure {
    /// A failure raised before any step ran.
    pub fn before_start(error: impl Into<PipelineError>) -> Self {
        Self {
            error: error.into(),
            cleanup_errors: Vec::new(),
            retained_templates: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_driver_cancellation_maps_to_cancelled() {
        let err = PipelineError::driver("failed to stop server", DriverError::Cancelled);
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        let timeout = PipelineError::driver(
            "failed to create server",
            DriverError::Timeout {
                what: "server x to start".to_string(),
                after: Duration::from_secs(300),
            },
        );
        let rejected = PipelineError::driver(
            "failed to create server",
            DriverError::rejected("PLAN_NOT_FOUND", "no such plan"),
        );
        assert!(timeout.is_timeout());
        assert!(!rejected.is_timeout());
        assert!(rejected.to_string().starts_with("failed to create server: "));
    }

    #[test]
    fn test_partial_failure_message() {
        let err = PipelineError::PartialFailure {
            operation: "clone",
            total: 3,
            failures: vec!["de-fra1: quota".to_string()],
        };
        assert_eq!(err.to_string(), "clone failed in 1 of 3 zones: de-fra1: quota");
    }

    #[test]
    fn test_unsettled_cancellation_maps_to_cancelled() {
        let storage = crate::driver::Storage {
            uuid: "disk-1".to_string(),
            title: "imagesmith-import".to_string(),
            size: 10,
            tier: "maxiops".to_string(),
            zone: "fi-hel1".to_string(),
            state: crate::driver::StorageState::Maintenance,
            kind: crate::driver::StorageType::Disk,
            created: None,
        };
        let err = PipelineError::driver(
            "failed to create storage",
            DriverError::unsettled(crate::driver::Created::Storage(storage), DriverError::Cancelled),
        );
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_failure_displays_terminal_error() {
        let failure = PipelineFailure {
            error: PipelineError::MissingState("server"),
            cleanup_errors: vec![PipelineError::Cancelled],
            retained_templates: Vec::new(),
        };
        assert_eq!(failure.to_string(), "Missing pipeline state: server");
        assert_eq!(failure.cleanup_errors.len(), 1);
    }
}
