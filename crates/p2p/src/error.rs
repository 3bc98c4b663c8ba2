use libp2p::Multiaddr;
use relay_circuit::ConfigError;
use relay_network::TransportError;
use thiserror::Error;

/// A listen address that could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenFailure {
    pub address: Multiaddr,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid relay configuration: {0}")]
    Relay(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to build network behaviour: {0}")]
    Behaviour(String),
    #[error("no listen address could be bound ({} failed)", failures.len())]
    NoListeners { failures: Vec<ListenFailure> },
    #[error("protocol handler already registered: {0}")]
    AlreadyRegistered(String),
    #[error("relay swarm task has stopped")]
    Stopped,
}
