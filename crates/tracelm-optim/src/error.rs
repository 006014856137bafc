//! Error types for the optimization layer.

use thiserror::Error;
use tracelm_core::{BundleError, CoreError};

/// Errors surfaced by the optimizer, the trainer and the LLM providers.
///
/// Malformed model replies are not errors: they parse to an empty update.
#[derive(Debug, Error)]
pub enum OptimError {
    /// Structural problem in the trace graph.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The provider could not be reached or answered with a failure status.
    #[error("provider error: {0}")]
    Provider(String),

    /// Missing or unsupported provider configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operator failed and was configured not to capture the failure.
    #[error("execution failed in '{op}': {message}")]
    Execution { op: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BundleError> for OptimError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Core(core) => OptimError::Core(core),
            BundleError::Execution(failure) => OptimError::Execution {
                op: failure.op,
                message: failure.message,
            },
            BundleError::Uncaught { op, message } => OptimError::Execution { op, message },
        }
    }
}
