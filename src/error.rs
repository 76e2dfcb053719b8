//! Error taxonomy shared by the receive, buffer and playback stages

use std::io;

use thiserror::Error;

use crate::pipeline::types::MediaKind;

/// Malformed or truncated frame on a media connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("truncated frame header ({received} of {expected} bytes)")]
    TruncatedHeader { expected: usize, received: usize },
    #[error("frame declares a zero-length payload")]
    ZeroLength,
    #[error("truncated frame body ({received} of {expected} bytes)")]
    TruncatedBody { expected: usize, received: usize },
    #[error("timestamped frame has no '|' delimiter")]
    MissingDelimiter,
    #[error("invalid frame timestamp '{0}'")]
    BadTimestamp(String),
}

/// Errors surfaced by a media or control connection
#[derive(Debug, Error)]
pub enum StreamError {
    /// Peer closed the connection, cleanly or abruptly
    #[error("connection closed")]
    ConnectionClosed,
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("{0}")]
    Io(io::Error),
}

impl StreamError {
    pub fn protocol(message: impl Into<String>) -> Self {
        StreamError::ProtocolViolation(message.into())
    }

    /// Whether the receive loop may skip the offending frame and keep reading
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Framing(_))
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        if is_disconnect(&err) {
            StreamError::ConnectionClosed
        } else {
            StreamError::Io(err)
        }
    }
}

/// I/O error kinds that mean the peer went away
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Rendering or audio output failure. Never fatal to a session.
#[derive(Debug, Error)]
#[error("{kind} sink: {message}")]
pub struct SinkError {
    pub kind: MediaKind,
    pub message: String,
}

impl SinkError {
    pub fn video(message: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            message: message.into(),
        }
    }

    pub fn audio(message: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            message: message.into(),
        }
    }
}

/// Video payload could not be turned into a displayable frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("frame decode failed: {0}")]
pub struct DecodeError(pub String);

/// Rejected insertion into the synchronization buffer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("{kind} key {key} is already buffered")]
    Duplicate { kind: MediaKind, key: String },
    #[error("{kind} key {key} is not newer than the last played key")]
    Late { kind: MediaKind, key: String },
    #[error("{kind} stream mixes sequential and timestamp keys")]
    KeyKindMismatch { kind: MediaKind },
    #[error("{kind} stream is closed")]
    Closed { kind: MediaKind },
}

/// Rejected player configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
    #[error("{first} and {second} ports are both {port}")]
    PortClash {
        first: &'static str,
        second: &'static str,
        port: u16,
    },
}
