use thiserror::Error;

use crate::internal::data_types::{CallStatus, TargetId};

pub type CallResult<T> = Result<T, CallError>;

/// Errors surfaced by the call layer
///
/// `InvalidState` and `TrackAttachFailed` are expected under racy signaling and are
/// normally just logged. `MediaAcquisitionFailed` and `Signaling` are the ones worth
/// showing to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{operation} is not valid while the call is {status}")]
    InvalidState {
        operation: &'static str,
        status: CallStatus,
    },

    #[error("could not acquire camera/microphone: {0}")]
    MediaAcquisitionFailed(String),

    #[error("no response within {seconds} seconds")]
    SignalingTimeout { seconds: u64 },

    #[error("failed to attach media to {target}: {reason}")]
    TrackAttachFailed { target: TargetId, reason: String },

    #[error("call history could not be persisted: {0}")]
    PersistenceFailure(String),

    #[error("signaling failure: {0}")]
    Signaling(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid call window location: {0}")]
    InvalidLocation(String),

    #[error("the incoming call feed already has a subscriber")]
    FeedBusy,

    #[error("the call controller is no longer running")]
    ControllerClosed,
}

impl CallError {
    pub(crate) fn invalid_state(operation: &'static str, status: CallStatus) -> Self {
        CallError::InvalidState { operation, status }
    }

    /// whether the UI should explain this error to the user
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CallError::MediaAcquisitionFailed(_) | CallError::Signaling(_)
        )
    }
}
