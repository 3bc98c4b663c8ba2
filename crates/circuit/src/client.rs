//! Peer side of the hop and stop protocols.
//!
//! The stream-level functions work over any byte stream; `reserve` and
//! `connect` open the stream through a libp2p [`Control`] handle first.

use std::fmt;
use std::time::Duration;

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use libp2p_stream::{Control, OpenStreamError};
use relay_network::{ProtocolMismatch, RELAY_HOP_PROTOCOL};

use crate::codec::{read_message, write_message, HopRequest, HopResponse, StopRequest, StopResponse};
use crate::config::CircuitLimit;
use crate::error::RelayError;

/// A reservation granted by a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationAccepted {
    pub ttl: Duration,
    /// Addresses the relay is reachable on.
    pub addrs: Vec<Multiaddr>,
    pub limit: Option<CircuitLimit>,
}

impl ReservationAccepted {
    /// Relayed addresses other peers can dial to reach `local` through
    /// `relay`.
    pub fn relayed_addresses(&self, relay: PeerId, local: PeerId) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| {
                addr.clone()
                    .with_p2p(relay)
                    .unwrap_or_else(|addr| addr)
                    .with(libp2p::multiaddr::Protocol::P2pCircuit)
                    .with(libp2p::multiaddr::Protocol::P2p(local))
            })
            .collect()
    }
}

/// A reservation whose hop stream is still open.
///
/// The relay keeps the stream open for the lifetime of the reservation, and
/// an open stream keeps the connection to the relay from being closed as
/// idle. Dropping this lets the connection idle out again; the slot itself
/// stays until it expires or the connection closes.
pub struct HeldReservation<S = libp2p::Stream> {
    pub accepted: ReservationAccepted,
    stream: S,
}

impl<S: AsyncWrite + Unpin> HeldReservation<S> {
    pub async fn close(mut self) {
        let _ = self.stream.close().await;
    }
}

impl<S> fmt::Debug for HeldReservation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldReservation")
            .field("accepted", &self.accepted)
            .finish_non_exhaustive()
    }
}

/// One end of an established relayed connection.
#[derive(Debug)]
pub struct RelayedConnection<S> {
    /// The peer on the far side of the relay.
    pub peer: PeerId,
    pub limit: Option<CircuitLimit>,
    pub stream: S,
}

pub async fn request_reservation<S>(stream: &mut S) -> Result<ReservationAccepted, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &HopRequest::Reserve).await?;
    match read_message(stream).await? {
        HopResponse::Reserved {
            ttl_secs,
            addrs,
            limit,
        } => Ok(ReservationAccepted {
            ttl: Duration::from_secs(ttl_secs),
            addrs,
            limit,
        }),
        HopResponse::Denied { reason } => Err(RelayError::Denied(reason)),
        HopResponse::Connected { .. } => Err(RelayError::UnexpectedMessage("connected")),
    }
}

/// Ask the relay on `stream` for a circuit to `target`. On success the
/// stream carries the target's bytes from here on.
pub async fn request_circuit<S>(mut stream: S, target: PeerId) -> Result<RelayedConnection<S>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(&mut stream, &HopRequest::Connect { peer: target }).await?;
    match read_message(&mut stream).await? {
        HopResponse::Connected { limit } => Ok(RelayedConnection {
            peer: target,
            limit,
            stream,
        }),
        HopResponse::Denied { reason } => Err(RelayError::Denied(reason)),
        HopResponse::Reserved { .. } => Err(RelayError::UnexpectedMessage("reserved")),
    }
}

/// Accept a circuit the relay opened on the stop protocol.
pub async fn accept_stop<S>(mut stream: S) -> Result<RelayedConnection<S>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let StopRequest::Connect { peer, limit } = read_message(&mut stream).await?;
    write_message(&mut stream, &StopResponse::Accepted).await?;
    Ok(RelayedConnection {
        peer,
        limit,
        stream,
    })
}

/// Reserve a slot on `relay`. The caller must already be connected to it
/// and should keep the returned handle for as long as it wants to be
/// reachable through the relay.
pub async fn reserve(control: &mut Control, relay: PeerId) -> Result<HeldReservation, RelayError> {
    let mut stream = open(control, relay, RELAY_HOP_PROTOCOL).await?;
    let accepted = request_reservation(&mut stream).await?;
    Ok(HeldReservation { accepted, stream })
}

/// Open a circuit to `target` through `relay`.
pub async fn connect(
    control: &mut Control,
    relay: PeerId,
    target: PeerId,
) -> Result<RelayedConnection<libp2p::Stream>, RelayError> {
    let stream = open(control, relay, RELAY_HOP_PROTOCOL).await?;
    request_circuit(stream, target).await
}

async fn open(
    control: &mut Control,
    peer: PeerId,
    protocol: StreamProtocol,
) -> Result<libp2p::Stream, RelayError> {
    control
        .open_stream(peer, protocol)
        .await
        .map_err(|err| match err {
            OpenStreamError::UnsupportedProtocol(protocol) => {
                RelayError::ProtocolMismatch(ProtocolMismatch(protocol.to_string()))
            }
            other => RelayError::OpenStream {
                peer,
                reason: other.to_string(),
            },
        })
}
