use thiserror::Error;

use crate::devices::PermissionKind;
use crate::transport::TransportError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeetError {
    #[error("{kind} permission denied")]
    PermissionDenied { kind: PermissionKind },
    #[error("constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),
    #[error("room probe failed: {0}")]
    RoomProbeFailure(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("message has neither text nor attachment")]
    EmptyMessage,
}

/// User-facing path a shell should take for a given failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    /// Persistent, dismissable notice asking to change the browser-level
    /// permission. Not retried automatically.
    PermissionNotice(PermissionKind),
    /// One-line diagnostic; the rest of setup stays usable.
    Diagnostic(String),
    /// Leave the call screen and go back to setup.
    ReturnToSetup,
    None,
}

impl MeetError {
    pub fn remediation(&self) -> Remediation {
        match self {
            MeetError::PermissionDenied { kind } => Remediation::PermissionNotice(*kind),
            MeetError::ConstraintsUnsatisfiable(_) => Remediation::Diagnostic(
                "OverconstrainedError: The constraints could not be satisfied by the available devices."
                    .to_string(),
            ),
            MeetError::RoomProbeFailure(_) | MeetError::EmptyMessage => Remediation::None,
            MeetError::Connection(_) => Remediation::ReturnToSetup,
            MeetError::Device(msg) | MeetError::InvalidRoomId(msg) | MeetError::Room(msg) => {
                Remediation::Diagnostic(msg.clone())
            }
        }
    }
}

impl From<TransportError> for MeetError {
    fn from(e: TransportError) -> Self {
        MeetError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_and_constraint_failures_take_distinct_paths() {
        let denied = MeetError::PermissionDenied { kind: PermissionKind::Camera };
        let constrained = MeetError::ConstraintsUnsatisfiable("camera-9".into());

        assert_eq!(denied.remediation(), Remediation::PermissionNotice(PermissionKind::Camera));
        match constrained.remediation() {
            Remediation::Diagnostic(line) => assert!(line.starts_with("OverconstrainedError")),
            other => panic!("expected diagnostic, got {other:?}"),
        }
    }

    #[test]
    fn probe_failure_is_not_escalated() {
        let err = MeetError::RoomProbeFailure("timeout".into());
        assert_eq!(err.remediation(), Remediation::None);
    }

    #[test]
    fn connection_failure_returns_to_setup() {
        let err = MeetError::Connection("peer-unavailable".into());
        assert_eq!(err.remediation(), Remediation::ReturnToSetup);
        assert_eq!(err.to_string(), "connection failed: peer-unavailable");
    }
}
