//! Relay Network Core
//!
//! Networking primitives the relay node is assembled from.
//!
//! ## Modules
//! - `identity`: Peer identity loading, generation and persistence
//! - `transport`: Transport registry, noise + yamux upgrade, dial routing
//! - `protocol`: Closed table of stream protocols and stream error classes
//! - `reachability`: Tri-state NAT reachability verdict from dial-back probes
//! - `error`: Identity, transport, handshake and protocol errors

pub mod error;
pub mod identity;
pub mod protocol;
pub mod reachability;
pub mod transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

pub use error::{DialAttempt, HandshakeError, IdentityError, ProtocolMismatch, TransportError};
pub use identity::{
    load_identity, load_or_generate_identity_file, persist_identity, GenerateReason,
    IdentityLoad, IdentitySource, PeerIdentity,
};
pub use protocol::{
    classify_stream_error, recognised_services, ServiceProtocol, StreamClosure,
    IDENTIFY_PROTOCOL_VERSION, RELAY_HOP_PROTOCOL, RELAY_STOP_PROTOCOL,
};
pub use reachability::{ProbeOutcome, Reachability, ReachabilityConfig, ReachabilityTracker};
pub use transport::{build_transport, dial_failure, BoxedTransport, TransportConfig, TransportKind};

pub use libp2p::{Multiaddr, PeerId};
