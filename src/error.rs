use std::process::ExitStatus;
use thiserror::Error;

/// Errors raised by the control channel, the wire codec and the statistics engine.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The agent never created its control segment within the retry budget.
    #[error("control segment '{segment}' did not appear after {attempts} attempts")]
    AttachTimeout { segment: String, attempts: u32 },

    /// The agent reported a measurement mode this manager does not know.
    #[error("unknown agent type {0}")]
    UnknownAgentType(i32),

    /// The client sent something that is not a valid message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A report was requested but no valid samples were recorded.
    #[error("no valid samples for {0} report")]
    EmptySampleSet(&'static str),

    /// The agent process exited on its own before teardown.
    #[error("agent exited unexpectedly with {0}")]
    WorkerExitedUnexpectedly(ExitStatus),

    #[error("invalid offered load {0}")]
    InvalidLoad(u32),

    #[error("shared memory segment '{segment}': {reason}")]
    SharedMemory { segment: String, reason: String },

    #[error("load-shaping library: {0}")]
    LoadShaper(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Whether the error only aborts the in-flight request rather than the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ManagerError::EmptySampleSet(_) | ManagerError::InvalidLoad(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(ManagerError::EmptySampleSet("latency").is_recoverable());
        assert!(ManagerError::InvalidLoad(0).is_recoverable());
        assert!(!ManagerError::ProtocolViolation("bad".into()).is_recoverable());
        assert!(!ManagerError::UnknownAgentType(9).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = ManagerError::AttachTimeout {
            segment: "/lancetcontrol".to_string(),
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "control segment '/lancetcontrol' did not appear after 10 attempts"
        );
        assert_eq!(
            ManagerError::EmptySampleSet("latency").to_string(),
            "no valid samples for latency report"
        );
    }
}
