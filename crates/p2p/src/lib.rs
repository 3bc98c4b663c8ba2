//! Relay P2P node
//!
//! Wires identity, transports, the composed libp2p behaviour and the circuit
//! relay server into a running node.
//!
//! - **behaviour**: identify, ping, autonat, gossipsub and raw protocol streams
//! - **discovery**: pass-through feed of the gossip peer discovery topic
//! - **node**: startup, listener binding, dialing, swarm event loop, shutdown

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod node;

pub use behaviour::{RelayBehaviour, RelayBehaviourEvent};
pub use discovery::{DiscoveryMessage, PUBSUB_PEER_DISCOVERY};
pub use error::{ListenFailure, NodeError};
pub use node::{
    default_listen_address, ListenerReport, ListenerStatus, NodeConfig, RelayNode,
    StartupReport, DEFAULT_PORT,
};

pub use libp2p::{Multiaddr, PeerId};
