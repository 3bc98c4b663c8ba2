//! Error types shared by the networking layer.

use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

use crate::transport::TransportKind;

/// Failure to turn persisted bytes into a usable peer identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity blob is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity field `{field}` is not valid base64: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("identity field `{field}` does not hold a valid key: {source}")]
    Key {
        field: &'static str,
        #[source]
        source: libp2p::identity::DecodingError,
    },
    #[error("identity blob has no private key")]
    MissingPrivateKey,
    #[error("identity id `{0}` is not a valid peer id")]
    InvalidPeerId(String),
    #[error("identity id {declared} does not match key-derived id {derived}")]
    PeerIdMismatch { declared: PeerId, derived: PeerId },
    #[error("identity public key does not match the private key")]
    PublicKeyMismatch,
}

/// A single failed attempt while dialing one candidate address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialAttempt {
    pub address: Multiaddr,
    pub reason: String,
}

/// Listener and dialer failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address {0} does not map to any known transport")]
    Unsupported(Multiaddr),
    #[error("transport {kind} is not registered (address {address})")]
    NotRegistered {
        kind: TransportKind,
        address: Multiaddr,
    },
    #[error("failed to listen on {address}: {reason}")]
    Listen { address: Multiaddr, reason: String },
    #[error("no candidate addresses supplied for {0}")]
    NoCandidates(PeerId),
    #[error("all {} dial attempts failed: {}", attempts.len(), summarize(attempts))]
    DialFailed { attempts: Vec<DialAttempt> },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("failed to build transport stack: {0}")]
    Build(String),
}

/// Security or multiplexer negotiation failure on a single connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("remote proved identity {actual} but {expected} was expected")]
    PeerMismatch { expected: PeerId, actual: PeerId },
    #[error("handshake did not complete in time")]
    Timeout,
    #[error("handshake negotiation failed: {0}")]
    Negotiation(String),
}

/// No protocol in the local table matches what the remote asked for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("protocol {0} is not supported")]
pub struct ProtocolMismatch(pub String);

fn summarize(attempts: &[DialAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| format!("{} ({})", attempt.address, attempt.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
