use std::path::PathBuf;

use testwrap_contracts::{EXIT_LAUNCH_FAILURE, EXIT_SETUP_FAILURE};
use thiserror::Error;

/// Conditions that stop an invocation before or while starting the test.
///
/// A test that runs and exits non-zero is not an error here; that outcome travels
/// in [`crate::launcher::ExecutionResult`].
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid runfile {logical:?}: {reason}")]
    InvalidRunfile { logical: String, reason: String },

    #[error("missing data dependency {logical:?}: {} does not exist", real.display())]
    MissingDependency { logical: String, real: PathBuf },

    #[error("shard {index}: cannot set up status directory {}: {source}", dir.display())]
    ShardSetupError {
        index: u32,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("launch {}: {source}", program.display())]
    LaunchError {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WrapperError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WrapperError::Io {
            context: context.into(),
            source,
        }
    }

    /// Reserved wrapper exit code; launch failures are kept apart from setup failures
    /// so the orchestrator can classify them.
    pub fn exit_code(&self) -> u8 {
        match self {
            WrapperError::LaunchError { .. } => EXIT_LAUNCH_FAILURE,
            _ => EXIT_SETUP_FAILURE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WrapperError::InvalidInvocation(_) => "invalid_invocation",
            WrapperError::InvalidPolicy(_) => "invalid_policy",
            WrapperError::InvalidRunfile { .. } => "invalid_runfile",
            WrapperError::MissingDependency { .. } => "missing_dependency",
            WrapperError::ShardSetupError { .. } => "shard_setup",
            WrapperError::LaunchError { .. } => "launch",
            WrapperError::Io { .. } => "io",
        }
    }
}

pub type Result<T, E = WrapperError> = std::result::Result<T, E>;
