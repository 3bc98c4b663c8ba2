use std::fmt;
use std::io;

use libp2p::PeerId;
use relay_network::ProtocolMismatch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a reservation or connect request was refused. Sent to the requester
/// as part of the protocol response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("relay has no reservation slots left")]
    ReservationRefused,
    #[error("target has no live reservation")]
    NoReservation,
    #[error("relay resource limit exceeded")]
    ResourceLimitExceeded,
    #[error("permission denied")]
    PermissionDenied,
    #[error("relay could not reach the target")]
    ConnectionFailed,
    #[error("malformed request")]
    MalformedMessage,
    #[error("unexpected request")]
    UnexpectedMessage,
}

/// Which half of a circuit a splice failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SourceToDestination,
    DestinationToSource,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::SourceToDestination => "source -> destination",
            Direction::DestinationToSource => "destination -> source",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Bytes,
    Duration,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::Bytes => "byte",
            LimitKind::Duration => "duration",
        })
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request denied: {0}")]
    Denied(DenyReason),
    #[error("relay frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("malformed relay message: {0}")]
    Malformed(String),
    #[error("unexpected relay message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("stream ended before a complete message arrived")]
    UnexpectedEof,
    #[error("timed out waiting for relay message")]
    Timeout,
    #[error(transparent)]
    ProtocolMismatch(#[from] ProtocolMismatch),
    #[error("failed to open stream to {peer}: {reason}")]
    OpenStream { peer: PeerId, reason: String },
    #[error("connection closed while relaying {0}")]
    ConnectionClosed(Direction),
    #[error("relay {direction} failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
    #[error("circuit {0} limit exceeded")]
    LimitExceeded(LimitKind),
    #[error("stream error: {0}")]
    Stream(#[from] io::Error),
}

impl RelayError {
    /// Classify an I/O failure on one direction of a splice.
    pub(crate) fn splice(direction: Direction, source: io::Error) -> Self {
        match relay_network::classify_stream_error(&source) {
            relay_network::StreamClosure::ConnectionClosed => RelayError::ConnectionClosed(direction),
            relay_network::StreamClosure::StreamError => RelayError::Io { direction, source },
        }
    }
}
