//! Error types for the chat relay
//!
//! Defines connection-fatal errors, request decoding errors and
//! per-recipient delivery errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::crypto::CodecError;

/// Application-level errors
///
/// Everything here terminates the connection that raised it and nothing else.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encryption or decryption failed (fatal - framing can't be trusted)
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer sent a frame the protocol doesn't allow at this point
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,
}

/// Request decoding errors
///
/// Never fatal: the handler answers with the generic error marker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Payload doesn't start with a known tag
    #[error("Unknown request tag")]
    UnknownTag,

    /// Fewer fields than the tag requires
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A required identifier is empty
    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    /// Entrance mode other than register/login
    #[error("Unknown entrance mode: {0}")]
    InvalidMode(String),

    /// Decrypted payload is not valid UTF-8
    #[error("Payload is not valid UTF-8")]
    NotUtf8,

    /// Plaintext frame received after the key exchange
    #[error("Unencrypted frame")]
    Unencrypted,
}

/// Message delivery errors
///
/// Local to one recipient; the rest of a fan-out continues.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient's writer has gone away (disconnected)
    #[error("Channel closed")]
    ChannelClosed,

    /// The recipient isn't draining its outbound queue
    #[error("Channel full")]
    ChannelFull,

    /// Encrypting for the recipient failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `CHAT_HISTORY_LIMIT` is not a positive integer
    #[error("Invalid history limit: {0}")]
    InvalidHistoryLimit(String),
}
