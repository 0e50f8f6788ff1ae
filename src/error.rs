//! Errors surfaced by the correlator and the control session.

use std::time::Duration;

use thiserror::Error;

use crate::control::ControlState;
use crate::transport::TransportError;

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No reply or terminal condition before the deadline.
    Timeout,
    /// The gateway answered with a nonzero result code, or with a reply that could not be read.
    RemoteRejected,
    /// The channel dropped, or refused a publish, while the operation was in flight.
    TransportLost,
    /// The operation is not allowed from the current session state.
    InvalidState,
    /// Input was rejected locally, nothing was published.
    InvalidArgument,
}

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No reply to `method` within `after`.
    #[error("'{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The gateway rejected `method` with a nonzero result code.
    #[error("'{method}' rejected by gateway (code={code}){}", detail(.message))]
    RemoteRejected {
        method: String,
        code: i64,
        message: Option<String>,
    },

    /// The reply to `method` matched its call but could not be interpreted.
    #[error("'{method}' got a malformed reply: {reason}")]
    MalformedReply { method: String, reason: String },

    /// The transport disconnected before a reply arrived.
    #[error("transport lost")]
    TransportLost,

    /// The transport refused to publish.
    #[error("publish failed")]
    Publish(#[from] TransportError),

    /// `operation` cannot run while the session is in `state`.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ControlState,
    },

    /// The request was malformed and was not sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request payload could not be serialized.
    #[error("failed to encode request")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RemoteRejected { .. } | Self::MalformedReply { .. } => ErrorKind::RemoteRejected,
            Self::TransportLost | Self::Publish(_) => ErrorKind::TransportLost,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidArgument(_) | Self::Encode(_) => ErrorKind::InvalidArgument,
        }
    }

    /// The gateway's result code, for [`ErrorKind::RemoteRejected`].
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::RemoteRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = SessionError::Timeout {
            method: "drc_mode_enter".to_string(),
            after: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = SessionError::Publish(TransportError::NotConnected);
        assert_eq!(err.kind(), ErrorKind::TransportLost);

        let err = SessionError::invalid_argument("missing client_id");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rejection_display_and_code() {
        let err = SessionError::RemoteRejected {
            method: "drc_mode_enter".to_string(),
            code: 319_001,
            message: Some("not allowed".to_string()),
        };

        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        assert_eq!(err.remote_code(), Some(319_001));
        let text = err.to_string();
        assert!(text.contains("319001"));
        assert!(text.contains("not allowed"));

        let err = SessionError::RemoteRejected {
            method: "m".to_string(),
            code: 1,
            message: None,
        };
        assert!(err.to_string().ends_with("(code=1)"));
    }

    #[test]
    fn test_malformed_reply_is_a_rejection_without_code() {
        let err = SessionError::MalformedReply {
            method: "drc_mode_enter".to_string(),
            reason: "info block without code".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        assert_eq!(err.remote_code(), None);
        assert!(err.to_string().contains("info block without code"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = SessionError::InvalidState {
            operation: "enter DRC mode",
            state: ControlState::Idle,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "cannot enter DRC mode while IDLE");
    }
}
