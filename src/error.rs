use crate::vm::{Action, LifecycleState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VesselError {
    #[error("VM '{0}' not found")]
    UnknownVm(String),
    #[error(
        "Unknown action '{0}' (expected start, resume, reboot, shutdown, poweroff or pause)"
    )]
    UnknownAction(String),
    #[error("VM '{vm}' is already {state}; '{action}' would not change anything")]
    RedundantAction {
        vm: String,
        action: Action,
        state: LifecycleState,
    },
    #[error("VM '{vm}' already has a '{action}' command in flight")]
    CommandInFlight { vm: String, action: Action },
    #[error("Network error: {0}")]
    NetworkFailure(String),
    #[error("Unexpected response shape: {0}")]
    UnexpectedResponseShape(String),
    #[error("{action} failed for VM '{vm}': {source}")]
    ActionFailed {
        action: Action,
        vm: String,
        #[source]
        source: Box<VesselError>,
    },
    #[error("Snapshot '{snapshot}' not found for VM '{vm}'")]
    SnapshotNotFound { vm: String, snapshot: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    SerdeError(String),
}

impl VesselError {
    /// Errors detected before anything is sent to the backend.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            VesselError::UnknownVm(_)
                | VesselError::UnknownAction(_)
                | VesselError::RedundantAction { .. }
                | VesselError::CommandInFlight { .. }
        )
    }
}

impl From<toml::de::Error> for VesselError {
    fn from(err: toml::de::Error) -> Self {
        VesselError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        VesselError::SerdeError(err.to_string())
    }
}

impl From<reqwest::Error> for VesselError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VesselError::NetworkFailure(format!("request timed out: {}", err))
        } else {
            VesselError::NetworkFailure(err.to_string())
        }
    }
}
