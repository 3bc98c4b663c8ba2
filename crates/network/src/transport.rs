//! Transport registry.
//!
//! Every listener and dialer the relay supports is composed into one boxed
//! libp2p transport. Raw connections are upgraded with noise and yamux under
//! a single handshake deadline, so what leaves this module is always an
//! authenticated, multiplexed connection bound to a verified peer id.

use std::fmt;
use std::time::Duration;

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::{Boxed, MemoryTransport, OptionalTransport};
use libp2p::core::upgrade;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::DialError;
use libp2p::{noise, tcp, websocket, yamux, Multiaddr, PeerId, Transport};
use serde::{Deserialize, Serialize};

use crate::error::{DialAttempt, HandshakeError, TransportError};

pub type BoxedTransport = Boxed<(PeerId, StreamMuxerBox)>;

/// Closed set of transport families an address can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Tcp,
    WebSocket,
    SecureWebSocket,
    WebRtc,
    WebRtcDirect,
    Circuit,
    Memory,
}

impl TransportKind {
    /// Classify an address by its protocol stack.
    pub fn of(address: &Multiaddr) -> Option<Self> {
        let mut tcp = false;
        let mut tls = false;
        let mut kind = None;

        for protocol in address.iter() {
            match protocol {
                Protocol::Memory(_) => return Some(Self::Memory),
                Protocol::P2pCircuit => return Some(Self::Circuit),
                Protocol::WebRTCDirect => kind = Some(Self::WebRtcDirect),
                Protocol::WebRTC => kind = Some(Self::WebRtc),
                Protocol::Tcp(_) => tcp = true,
                Protocol::Tls => tls = true,
                Protocol::Ws(_) if tcp => {
                    kind = Some(if tls {
                        Self::SecureWebSocket
                    } else {
                        Self::WebSocket
                    })
                }
                Protocol::Wss(_) if tcp => kind = Some(Self::SecureWebSocket),
                _ => {}
            }
        }

        kind.or(if tcp { Some(Self::Tcp) } else { None })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
            Self::SecureWebSocket => "wss",
            Self::WebRtc => "webrtc",
            Self::WebRtcDirect => "webrtc-direct",
            Self::Circuit => "p2p-circuit",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transports get registered and how connections are upgraded.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tcp: bool,
    pub websocket: bool,
    /// In-process transport, for tests and embedded setups.
    pub memory: bool,
    pub tcp_nodelay: bool,
    /// Deadline for the noise handshake plus multiplexer negotiation.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            websocket: true,
            memory: false,
            tcp_nodelay: true,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn memory_only() -> Self {
        Self {
            tcp: false,
            websocket: false,
            memory: true,
            ..Self::default()
        }
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => self.tcp,
            // wss is dialable through the websocket transport and announceable
            // behind a TLS-terminating proxy.
            TransportKind::WebSocket | TransportKind::SecureWebSocket => self.websocket,
            TransportKind::Memory => self.memory,
            TransportKind::WebRtc | TransportKind::WebRtcDirect | TransportKind::Circuit => false,
        }
    }

    pub fn registered_kinds(&self) -> Vec<TransportKind> {
        [
            TransportKind::Tcp,
            TransportKind::WebSocket,
            TransportKind::SecureWebSocket,
            TransportKind::Memory,
        ]
        .into_iter()
        .filter(|kind| self.supports(*kind))
        .collect()
    }

    /// Pick the registered transport responsible for `address`.
    pub fn route(&self, address: &Multiaddr) -> Result<TransportKind, TransportError> {
        let kind =
            TransportKind::of(address).ok_or_else(|| TransportError::Unsupported(address.clone()))?;
        if self.supports(kind) {
            Ok(kind)
        } else {
            Err(TransportError::NotRegistered {
                kind,
                address: address.clone(),
            })
        }
    }

    /// Every announced address must be served by a registered transport.
    pub fn validate_announce(&self, addresses: &[Multiaddr]) -> Result<(), TransportError> {
        for address in addresses {
            self.route(address)?;
        }
        Ok(())
    }

    /// Split dial candidates into routable ones, in their original order, and
    /// rejections for addresses no registered transport can handle.
    pub fn partition_candidates(
        &self,
        candidates: &[Multiaddr],
    ) -> (Vec<Multiaddr>, Vec<DialAttempt>) {
        let mut routable = Vec::new();
        let mut rejected = Vec::new();
        for address in candidates {
            match self.route(address) {
                Ok(_) => routable.push(address.clone()),
                Err(err) => rejected.push(DialAttempt {
                    address: address.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        (routable, rejected)
    }
}

/// Compose the registered transports and upgrade them to authenticated,
/// multiplexed connections.
pub fn build_transport(
    keypair: &Keypair,
    config: &TransportConfig,
) -> Result<BoxedTransport, TransportError> {
    let nodelay = config.tcp_nodelay;
    let memory = optional(config.memory, MemoryTransport::default);
    let websocket = optional(config.websocket, || {
        websocket::Config::new(tcp::tokio::Transport::new(
            tcp::Config::default().nodelay(nodelay),
        ))
    });
    let tcp = optional(config.tcp, || {
        tcp::tokio::Transport::new(tcp::Config::default().nodelay(nodelay))
    });

    let noise =
        noise::Config::new(keypair).map_err(|err| TransportError::Build(err.to_string()))?;

    Ok(memory
        .or_transport(websocket)
        .or_transport(tcp)
        .upgrade(upgrade::Version::V1)
        .authenticate(noise)
        .multiplex(yamux::Config::default())
        .timeout(config.handshake_timeout)
        .boxed())
}

fn optional<T>(enabled: bool, build: impl FnOnce() -> T) -> OptionalTransport<T> {
    if enabled {
        OptionalTransport::some(build())
    } else {
        OptionalTransport::none()
    }
}

/// Fold a swarm dial failure into the registry's error vocabulary.
///
/// `rejected` carries candidates that were never attempted because no
/// registered transport could route them.
pub fn dial_failure(
    expected: Option<PeerId>,
    error: &DialError,
    mut rejected: Vec<DialAttempt>,
) -> TransportError {
    match error {
        DialError::WrongPeerId { obtained, .. } => match expected {
            Some(expected) => TransportError::Handshake(HandshakeError::PeerMismatch {
                expected,
                actual: *obtained,
            }),
            None => TransportError::Handshake(HandshakeError::Negotiation(error.to_string())),
        },
        DialError::Transport(attempts) => {
            rejected.extend(attempts.iter().map(|(address, err)| DialAttempt {
                address: address.clone(),
                reason: err.to_string(),
            }));
            TransportError::DialFailed { attempts: rejected }
        }
        other => {
            rejected.push(DialAttempt {
                address: Multiaddr::empty(),
                reason: other.to_string(),
            });
            TransportError::DialFailed { attempts: rejected }
        }
    }
}
