//! Stream protocols spoken by the relay.
//!
//! Negotiation itself is multistream-select; this module pins down the closed
//! set of protocol names the node knows about so anything else fails with
//! [`ProtocolMismatch`] instead of being dispatched by string.

use std::io;

use libp2p::StreamProtocol;

use crate::error::ProtocolMismatch;

/// Hop protocol: reserving peers and circuit initiators talk to the relay.
pub const RELAY_HOP_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/relay-node/circuit/hop/1.0.0");
/// Stop protocol: the relay delivers a circuit to the reserved peer.
pub const RELAY_STOP_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/relay-node/circuit/stop/1.0.0");

/// Identify protocol version advertised by relay nodes.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/relay-node/1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceProtocol {
    RelayHop,
    RelayStop,
    Identify,
    IdentifyPush,
    Ping,
    AutoNat,
    Gossipsub,
}

const PROTOCOL_TABLE: &[(&str, ServiceProtocol)] = &[
    ("/relay-node/circuit/hop/1.0.0", ServiceProtocol::RelayHop),
    ("/relay-node/circuit/stop/1.0.0", ServiceProtocol::RelayStop),
    ("/ipfs/id/1.0.0", ServiceProtocol::Identify),
    ("/ipfs/id/push/1.0.0", ServiceProtocol::IdentifyPush),
    ("/ipfs/ping/1.0.0", ServiceProtocol::Ping),
    ("/libp2p/autonat/1.0.0", ServiceProtocol::AutoNat),
    ("/meshsub/1.2.0", ServiceProtocol::Gossipsub),
    ("/meshsub/1.1.0", ServiceProtocol::Gossipsub),
    ("/meshsub/1.0.0", ServiceProtocol::Gossipsub),
];

impl ServiceProtocol {
    /// Map a negotiated protocol name onto the closed set.
    pub fn lookup(name: &str) -> Result<Self, ProtocolMismatch> {
        PROTOCOL_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, protocol)| *protocol)
            .ok_or_else(|| ProtocolMismatch(name.to_string()))
    }

    /// Canonical (newest) protocol name for this service.
    pub fn name(self) -> &'static str {
        PROTOCOL_TABLE
            .iter()
            .find(|(_, protocol)| *protocol == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }
}

/// Services from `advertised` that the node recognises. Unknown names are
/// skipped.
pub fn recognised_services<'a, I>(advertised: I) -> Vec<ServiceProtocol>
where
    I: IntoIterator<Item = &'a StreamProtocol>,
{
    let mut services: Vec<ServiceProtocol> = advertised
        .into_iter()
        .filter_map(|protocol| ServiceProtocol::lookup(protocol.as_ref()).ok())
        .collect();
    services.dedup();
    services
}

/// How a stream ended when its I/O failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClosure {
    /// The underlying connection went away.
    ConnectionClosed,
    /// The stream failed on its own; the connection may still be alive.
    StreamError,
}

pub fn classify_stream_error(err: &io::Error) -> StreamClosure {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => StreamClosure::ConnectionClosed,
        _ => StreamClosure::StreamError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_protocols_resolve_through_table() {
        assert_eq!(
            ServiceProtocol::lookup(RELAY_HOP_PROTOCOL.as_ref()),
            Ok(ServiceProtocol::RelayHop)
        );
        assert_eq!(
            ServiceProtocol::lookup(RELAY_STOP_PROTOCOL.as_ref()),
            Ok(ServiceProtocol::RelayStop)
        );
        assert_eq!(ServiceProtocol::RelayStop.name(), RELAY_STOP_PROTOCOL.as_ref());
    }

    #[test]
    fn unknown_protocol_is_a_mismatch() {
        let err = ServiceProtocol::lookup("/libp2p/circuit/relay/0.2.0/hop").unwrap_err();
        assert_eq!(err.0, "/libp2p/circuit/relay/0.2.0/hop");
    }

    #[test]
    fn gossipsub_versions_collapse_to_one_service() {
        let advertised = [
            StreamProtocol::new("/meshsub/1.1.0"),
            StreamProtocol::new("/meshsub/1.0.0"),
            StreamProtocol::new("/some/app/1.0.0"),
            RELAY_STOP_PROTOCOL,
        ];
        assert_eq!(
            recognised_services(advertised.iter()),
            vec![ServiceProtocol::Gossipsub, ServiceProtocol::RelayStop]
        );
        assert_eq!(ServiceProtocol::Gossipsub.name(), "/meshsub/1.2.0");
    }

    #[test]
    fn connection_loss_is_distinguished_from_stream_errors() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let other = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert_eq!(classify_stream_error(&reset), StreamClosure::ConnectionClosed);
        assert_eq!(classify_stream_error(&other), StreamClosure::StreamError);
    }
}
