// src/core/errors.rs

//! Defines the primary error type for the entire PubSub stack.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the stack.
/// Variants mirror the status-code taxonomy of the OPC UA PubSub services:
/// every caller-visible operation returns one of these verbatim, and state
/// propagation carries them as the `cause` of a transition.
#[derive(Error, Debug, Clone)]
pub enum PubSubError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No PubSub component found for the given identifier")]
    NotFound,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Parent component is unavailable")]
    ResourceUnavailable,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),
}

impl PartialEq for PubSubError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PubSubError::Io(e1), PubSubError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PubSubError::InvalidArgument(s1), PubSubError::InvalidArgument(s2)) => s1 == s2,
            (PubSubError::ConfigurationError(s1), PubSubError::ConfigurationError(s2)) => s1 == s2,
            (PubSubError::NotSupported(s1), PubSubError::NotSupported(s2)) => s1 == s2,
            (PubSubError::NotImplemented(s1), PubSubError::NotImplemented(s2)) => s1 == s2,
            (PubSubError::Decode(s1), PubSubError::Decode(s2)) => s1 == s2,
            (PubSubError::Security(s1), PubSubError::Security(s2)) => s1 == s2,
            (PubSubError::Transport(s1), PubSubError::Transport(s2)) => s1 == s2,
            (PubSubError::Internal(s1), PubSubError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PubSubError {
    fn from(e: std::io::Error) -> Self {
        PubSubError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(e: serde_json::Error) -> Self {
        PubSubError::Decode(format!("JSON mapping error: {e}"))
    }
}
