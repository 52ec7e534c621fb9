use crate::library::config::Direction;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("number of connections must be between 1 and 10, got {0}")]
    InvalidConnections(usize),
    #[error("target URL is missing or empty")]
    MissingUrl,
    #[error("at least one test type (download or upload) must be selected")]
    NoPhaseSelected,
    #[error("upload size must be at least one byte")]
    InvalidUploadSize,
    #[error("transfer #{slot} could not be configured: {reason}")]
    Configuration { slot: usize, reason: String },
    #[error("engine rejected transfer #{slot}: {reason}")]
    Submission { slot: usize, reason: String },
    #[error("transfer for URL {target} failed: {reason}")]
    Transfer { target: String, reason: String },
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("no {direction} connections were successfully initiated")]
    BatchAbort { direction: Direction },
    #[error("reactor failure: {0}")]
    Reactor(#[from] io::Error),
    #[error("engine failure: {0}")]
    Engine(String),
}

impl SpeedTestError {
    /// Argument problems the operator has to fix before anything runs.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            SpeedTestError::InvalidConnections(_)
                | SpeedTestError::MissingUrl
                | SpeedTestError::NoPhaseSelected
                | SpeedTestError::InvalidUploadSize
        )
    }
}
