//! Error types for the impairment lab

use thiserror::Error;

/// Which end of an emulated link an operation targeted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    A,
    B,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LabError {
    /// Topology or container setup failed. Fatal to the run.
    #[error("Resource acquisition failed: {0}")]
    ResourceAcquisition(String),

    /// An external workload or capture process could not be spawned
    #[error("Failed to launch '{id}': {reason}")]
    TaskLaunch { id: String, reason: String },

    /// Stopping or signalling an external process failed
    #[error("Failed to terminate '{id}': {reason}")]
    TaskTermination { id: String, reason: String },

    /// Setting an impairment profile on a link failed.
    ///
    /// `partial` is set when side A already carries the new profile and
    /// side B failed afterwards; side A is not rolled back.
    #[error("Failed to apply impairment on link '{link}' side {side}: {reason}")]
    ImpairmentApply {
        link: String,
        side: Side,
        partial: bool,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An external tool ran but exited unsuccessfully
    #[error("Command '{command}' failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal error: {0}")]
    Nix(#[from] nix::Error),
}

impl LabError {
    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, LabError::ResourceAcquisition(_))
    }

    pub(crate) fn acquisition(context: &str, err: impl std::fmt::Display) -> Self {
        LabError::ResourceAcquisition(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_acquisition_is_fatal() {
        assert!(LabError::ResourceAcquisition("ns".into()).is_fatal());
        assert!(!LabError::TaskLaunch {
            id: "iperf".into(),
            reason: "not found".into()
        }
        .is_fatal());
        assert!(!LabError::ImpairmentApply {
            link: "middle".into(),
            side: Side::B,
            partial: true,
            reason: "tc".into()
        }
        .is_fatal());
    }

    #[test]
    fn impairment_error_names_link_and_side() {
        let err = LabError::ImpairmentApply {
            link: "middle".into(),
            side: Side::B,
            partial: true,
            reason: "RTNETLINK answers: No such device".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("middle"));
        assert!(msg.contains("side B"));
    }
}
