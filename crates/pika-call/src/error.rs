//! Error types for call signaling and negotiation.

use thiserror::Error;

/// Errors surfaced by the signaling relay adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay is not connected")]
    NotConnected,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors reported by a media endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or platform refused access to the capture device.
    #[error("media access denied: {0}")]
    PermissionDenied(String),

    #[error("no connection has been created")]
    NoConnection,

    #[error("media endpoint closed")]
    Closed,

    #[error("media endpoint error: {0}")]
    Failed(String),
}

/// Outcome taxonomy for a call session.
///
/// Sessions never return these across their public operations; they are
/// recorded as the session's `last_error` when it reaches `Failed`, or
/// returned by the controller when a request is refused up front.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Capture permission refused.
    #[error("media access denied")]
    MediaAccessDenied,

    #[error("signaling send failed: {0}")]
    SignalingSendFailed(String),

    /// Connectivity reported failed or disconnected.
    #[error("connection lost")]
    ConnectivityLost,

    /// Signal for a different or ended session.
    #[error("stale signal")]
    StaleSignal,

    /// Operation on a session that is already terminal.
    #[error("session already finished")]
    DoubleInvocation,

    #[error("a call is already active for {0}")]
    AlreadyActive(String),

    #[error("no answer from peer")]
    NoAnswer,

    /// Offer/Answer exchange or connectivity checks did not complete in time.
    #[error("negotiation timed out")]
    NegotiationTimeout,

    #[error("chat peer not found: {0}")]
    PeerNotFound(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),
}

impl CallError {
    /// Short status string safe to show the user. Raw transport and codec
    /// text is never included.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MediaAccessDenied => "Microphone or camera access denied",
            Self::SignalingSendFailed(_) | Self::Subscription(_) | Self::InvalidTopic(_) => {
                "Could not reach the other participant"
            }
            Self::ConnectivityLost => "Connection lost",
            Self::NoAnswer => "No answer",
            Self::NegotiationTimeout => "Call could not be connected",
            Self::AlreadyActive(_) => "Already in a call",
            Self::PeerNotFound(_) => "Chat peer not found",
            Self::Media(_) => "Call media failed",
            Self::StaleSignal | Self::DoubleInvocation => "Call ended",
        }
    }

    /// Whether placing the call again is a sensible user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyActive(_) | Self::PeerNotFound(_) | Self::DoubleInvocation
        )
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(_) => Self::MediaAccessDenied,
            other => Self::Media(other.to_string()),
        }
    }
}

impl From<RelayError> for CallError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidTopic(topic) => Self::InvalidTopic(topic),
            RelayError::Timeout(msg) => Self::Subscription(msg),
            other => Self::SignalingSendFailed(other.to_string()),
        }
    }
}
