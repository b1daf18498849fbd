//! Job-level error taxonomy.
//!
//! Per-test-case faults (missing executable, signals, timeouts, oversized
//! output) are not errors: they are [`ExecutionOutcome`](crate::ExecutionOutcome)
//! variants recorded in the results map. The errors below abort the job that
//! raised them and surface at the worker's top level.

use thiserror::Error;

/// Error type used by the grading services.
#[derive(Error, Debug)]
pub enum GraderError {
    /// A completion sentinel carried the wrong job key
    #[error("Sentinel {file} belongs to another job: expected {expected:?}, found {found:?}")]
    JobIntegrityFault {
        file: String,
        expected: String,
        found: String,
    },

    /// A completion sentinel never appeared
    #[error("Timed out after {waited_secs}s waiting for sentinel {file}")]
    SentinelTimeout { file: String, waited_secs: u64 },

    /// The build command failed; the job continues without an executable
    #[error("Build failed: {0}")]
    BuildFailure(String),

    /// Test case definition is unusable
    #[error("Invalid test case: {0}")]
    InvalidTestCase(String),

    /// Queue transport error
    #[error("Queue error: {0}")]
    Queue(String),

    /// File I/O error
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraderError {
    /// Returns the error code string for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            GraderError::JobIntegrityFault { .. } => "JOB_INTEGRITY_FAULT",
            GraderError::SentinelTimeout { .. } => "SENTINEL_TIMEOUT",
            GraderError::BuildFailure(_) => "BUILD_FAILURE",
            GraderError::InvalidTestCase(_) => "INVALID_TEST_CASE",
            GraderError::Queue(_) => "QUEUE_ERROR",
            GraderError::Io(_) => "FILE_ERROR",
            GraderError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the error must abort the whole job.
    ///
    /// Build failures degrade the job instead of aborting it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GraderError::BuildFailure(_))
    }
}

/// Result type alias using GraderError
pub type GraderResult<T> = Result<T, GraderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_fault_message() {
        let err = GraderError::JobIntegrityFault {
            file: "sync_files".to_string(),
            expected: "12.3".to_string(),
            found: "11.3".to_string(),
        };
        assert_eq!(err.error_code(), "JOB_INTEGRITY_FAULT");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("\"12.3\""));
    }

    #[test]
    fn test_build_failure_is_not_fatal() {
        let err = GraderError::BuildFailure("make exited with 2".to_string());
        assert!(!err.is_fatal());
    }
}
