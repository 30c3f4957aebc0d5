//! Error types for the chat relay
//!
//! Defines application-level errors, transport errors, and the smaller
//! errors raised by mailboxes, state machines and configuration.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::types::RoomId;

/// Application-level errors
///
/// Covers both fatal errors (startup, connection termination) and
/// local failures that only abort one operation (joining a closed room).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel send error (internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Room no longer accepts participants or messages
    #[error("Room {0} is closed")]
    RoomClosed(RoomId),

    /// Room manager no longer creates rooms
    #[error("Room manager already closed")]
    RoomManagerClosed,

    /// Room not registered with the manager
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Event rejected by a state machine
    #[error(transparent)]
    InvalidTransition(#[from] FsmError),

    /// Server was shut down
    #[error("Server closed")]
    ServerClosed,

    /// Bad command line or log destination
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced by the envelope stream
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream cleanly
    #[error("Stream closed")]
    Closed,

    /// The WebSocket broke
    #[error("WebSocket error: {0}")]
    WebSocket(tungstenite::Error),

    /// A frame could not be decoded into an envelope
    #[error("Malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the stream can still be used after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Decode(_))
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            other => TransportError::WebSocket(other),
        }
    }
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// State machine rejected an event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {event} inappropriate in current state {state}")]
pub struct FsmError {
    /// State the machine was in
    pub state: String,
    /// Event that was fired
    pub event: String,
}

/// Command line and logging configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Flag not recognised
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    /// Flag given without its value
    #[error("flag {0} requires a value")]
    MissingValue(String),

    /// Flag value could not be parsed
    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: String, value: String },

    /// Log file name rejected
    #[error("please provide a valid log file destination, instead of {0}")]
    InvalidLogFile(String),

    /// Log file could not be opened
    #[error("unable to open log file destination {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Global subscriber already installed
    #[error("logging already initialised: {0}")]
    Logging(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_close_maps_to_closed() {
        let err = TransportError::from(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, TransportError::Closed));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_decode_error_is_recoverable() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = TransportError::from(json_err);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fsm_error_message() {
        let err = FsmError {
            state: "booting".to_string(),
            event: "write_message".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "event write_message inappropriate in current state booting"
        );
    }
}
