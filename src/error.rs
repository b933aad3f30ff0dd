//! Error types for the call core
//!
//! Media failures are surfaced to the caller and return the session to idle.
//! Negotiation failures only ever cost the affected peer. Stale messages are
//! logged by the caller and otherwise ignored.

use thiserror::Error;

use crate::peer::types::ParticipantId;
use crate::session::CallState;

/// Errors produced by the call core
#[derive(Error, Debug)]
pub enum CallError {
    /// Capture permission denied or no matching device
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Malformed or rejected session description
    #[error("Negotiation with {participant} failed: {reason}")]
    Negotiation {
        participant: ParticipantId,
        reason: String,
    },

    /// The signaling channel refused the event
    #[error("Signaling delivery error: {0}")]
    SignalingDelivery(String),

    /// Inbound signaling payload failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    /// Operation not allowed in the current call state
    #[error("Invalid call state: expected {expected}, got {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: CallState,
    },

    /// The participant list of a new call is empty
    #[error("No participants to call")]
    NoParticipants,

    /// No connection exists for the participant
    #[error("No connection for participant {0}")]
    UnknownParticipant(ParticipantId),

    /// The connection was replaced or closed while the operation was suspended
    #[error("Connection to {0} was replaced while negotiating")]
    Superseded(ParticipantId),

    /// The call ended while the operation was suspended
    #[error("Call ended before the operation completed")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the WebRTC stack
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallError {
    pub(crate) fn negotiation(participant: &ParticipantId, reason: impl ToString) -> Self {
        CallError::Negotiation {
            participant: participant.clone(),
            reason: reason.to_string(),
        }
    }

    /// Human-readable reason shown when a call fails to start
    pub fn user_message(&self) -> String {
        match self {
            CallError::MediaAccess(_) => {
                "Camera or microphone is unavailable or access was denied".to_string()
            }
            CallError::Negotiation { .. } | CallError::Superseded(_) => {
                "Could not establish a connection with the other participant".to_string()
            }
            CallError::SignalingDelivery(_) => "Not connected to the chat server".to_string(),
            CallError::InvalidState { actual, .. } => match actual {
                CallState::Idle => "No call in progress".to_string(),
                _ => "A call is already in progress".to_string(),
            },
            CallError::Cancelled => "The call was ended".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
