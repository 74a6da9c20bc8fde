//! Relay errors and the JSON shape they take on the wire.

use nicolive::{LiveError, LiveId};
use serde::{Deserialize, Serialize};

use crate::subscriber::SubscriberId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry { retry_after_secs: u64 },
    CheckCredentials,
    Resubscribe,
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Live(#[from] LiveError),

    #[error("subscriber {subscriber} is not subscribed to {live_id}")]
    UnknownSubscription {
        live_id: LiveId,
        subscriber: SubscriberId,
    },
}

impl RelayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Live(e) => e.error_code(),
            Self::UnknownSubscription { .. } => "unknown_subscription",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::UnknownSubscription { .. } => RecoveryAction::Resubscribe,
            Self::Live(e) => match e {
                LiveError::Login | LiveError::NotLoggedIn | LiveError::Cookies(_) => {
                    RecoveryAction::CheckCredentials
                }
                LiveError::Timeout(_)
                | LiveError::Io(_)
                | LiveError::Http(_)
                | LiveError::Frame { .. } => RecoveryAction::Retry {
                    retry_after_secs: 5,
                },
                _ => RecoveryAction::None,
            },
        }
    }
}

/// Error frame sent to a websocket client before it is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub recovery: RecoveryAction,
}

impl From<&RelayError> for ErrorResponse {
    fn from(err: &RelayError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            recovery: err.recovery(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_errors_keep_their_code() {
        let err = RelayError::from(LiveError::ClosedStream);
        assert_eq!(err.error_code(), "closed_stream");
        assert_eq!(err.recovery(), RecoveryAction::None);
        assert_eq!(err.to_string(), "live stream is closed");
    }

    #[test]
    fn unknown_subscription() {
        let err = RelayError::UnknownSubscription {
            live_id: LiveId::parse("lv9").unwrap(),
            subscriber: SubscriberId::new(),
        };
        assert_eq!(err.error_code(), "unknown_subscription");
        assert_eq!(err.recovery(), RecoveryAction::Resubscribe);
    }

    #[test]
    fn error_response_json() {
        let err = RelayError::from(LiveError::Login);
        let json = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(json["error"], "login_error");
        assert_eq!(json["message"], "login incorrect");
        assert_eq!(json["recovery"]["action"], "check_credentials");

        let err = RelayError::from(LiveError::Timeout("connecting"));
        let json = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(json["recovery"]["action"], "retry");
        assert_eq!(json["recovery"]["retry_after_secs"], 5);
    }
}
