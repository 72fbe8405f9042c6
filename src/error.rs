//! Error types for the schema-change scheduler

use std::path::PathBuf;

use thiserror::Error;

use crate::datastore::Connection;
use crate::schedule::ScheduledChange;
use crate::schema::{DependencyEdge, FeatureRef};

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;

/// Reasons a scheduled change is rejected, at submission or at apply time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Feature {feature} requires {missing}, which is neither enabled nor scheduled earlier")]
    UnmetDependency { feature: FeatureRef, missing: FeatureRef },

    #[error("Disabling {feature} would leave enabled feature {dependent} without its prerequisite")]
    WouldBreakDependent { feature: FeatureRef, dependent: FeatureRef },

    #[error("Feature dependency cycle through {edge}")]
    DependencyCycle { edge: DependencyEdge },

    #[error("Module already installed or scheduled for install: {module}")]
    DuplicateModule { module: String },

    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("Feature not found: {feature}")]
    FeatureNotFound { feature: FeatureRef },

    #[error("Module {module} is in use by {by}")]
    InUse { module: String, by: String },

    #[error("Module {module} imports {import}, which is not installed or on the search path")]
    MissingImport { module: String, import: String },
}

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Scheduled change #{} ({}) failed to apply: {reason}", change.seq, change.kind)]
    ApplyFailure {
        change: Box<ScheduledChange>,
        reason: ValidationError,
    },

    #[error("Concurrency fault: {0}")]
    ConcurrencyFault(String),

    #[error("Failed to parse schema {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Checksum mismatch in {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

/// A disconnect that did not go through
///
/// Carries the still-open connection so the caller can retry.
#[derive(Error, Debug)]
#[error("Failed to disconnect connection {}: {source}", connection.id())]
pub struct DisconnectError {
    pub connection: Connection,
    #[source]
    pub source: SchedError,
}

impl DisconnectError {
    /// Retry the disconnect
    pub fn retry(self) -> std::result::Result<(), DisconnectError> {
        self.connection.disconnect()
    }
}

impl From<DisconnectError> for SchedError {
    fn from(err: DisconnectError) -> Self {
        // the connection drops here and makes one more best-effort attempt
        err.source
    }
}

impl SchedError {
    /// The validation reason behind this error, if it has one
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            SchedError::Validation(reason) => Some(reason),
            SchedError::ApplyFailure { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
