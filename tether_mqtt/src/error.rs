// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Common error types

use std::fmt;
use std::io;

use thiserror::Error;

/// Error produced by a client operation. The category of error is specified
/// by the value of [`ErrorKind`].
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ClientError {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    /// Create a new [`ClientError`]
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// Create a new [`ClientError`] wrapping an underlying cause
    pub(crate) fn with_source(
        kind: ErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Return the corresponding [`ErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for ClientError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for ClientError {
    fn from(source: io::Error) -> Self {
        Self::with_source(ErrorKind::TransportFailure, source)
    }
}

/// An enumeration of categories of [`ClientError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The operation is not legal in the connection's current state
    InvalidState,
    /// A connect attempt was made on a connection that is not disconnected
    AlreadyConnected,
    /// The operation requires an established or recovering connection
    NotConnected,
    /// Invalid topic name or topic filter provided
    InvalidTopic,
    /// An operation, handshake or keep-alive deadline elapsed
    Timeout,
    /// The broker closed the channel without a disconnect from this client
    UnexpectedHangup,
    /// The operation was cancelled because the clean-session channel went away
    CancelledForCleanSession,
    /// The connection was destroyed while the operation was in flight
    ConnectionDestroyed,
    /// The peer violated the MQTT protocol
    ProtocolViolation,
    /// The transport channel failed to establish or carry data
    TransportFailure,
    /// Resource allocation failed (including packet id exhaustion)
    OutOfMemory,
    /// WebSocket support was not compiled into this build
    BuiltWithoutWebsockets,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidState => write!(f, "operation not legal in the current state"),
            ErrorKind::AlreadyConnected => write!(f, "connection is already connected"),
            ErrorKind::NotConnected => write!(f, "connection is not connected"),
            ErrorKind::InvalidTopic => write!(f, "invalid topic name or topic filter"),
            ErrorKind::Timeout => write!(f, "operation timed out"),
            ErrorKind::UnexpectedHangup => write!(f, "broker closed the connection unexpectedly"),
            ErrorKind::CancelledForCleanSession => {
                write!(f, "operation cancelled on clean-session channel loss")
            }
            ErrorKind::ConnectionDestroyed => {
                write!(f, "connection destroyed with operation in flight")
            }
            ErrorKind::ProtocolViolation => write!(f, "MQTT protocol violation"),
            ErrorKind::TransportFailure => write!(f, "transport channel failure"),
            ErrorKind::OutOfMemory => write!(f, "resource allocation failed"),
            ErrorKind::BuiltWithoutWebsockets => {
                write!(f, "websocket support not compiled into this build")
            }
        }
    }
}
