//! Circuit relay server.
//!
//! `RelayState` is the single owner of the reservation table and the live
//! circuit registry; every hop stream handler, the expiry sweep and the
//! disconnect handler go through it. Lock order is reservations, then
//! circuits.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stream, StreamExt};
use libp2p::{Multiaddr, PeerId};
use libp2p_stream::{Control, OpenStreamError};
use parking_lot::{Mutex, RwLock};
use relay_network::{ProtocolMismatch, RELAY_STOP_PROTOCOL};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::circuit::{splice, CircuitId, CircuitRegistry, SpliceStats};
use crate::codec::{read_message, write_message, HopRequest, HopResponse, StopRequest, StopResponse};
use crate::config::{CircuitLimit, ConfigError, RelayConfig};
use crate::error::{DenyReason, RelayError};
use crate::reservation::{Reservation, ReservationGrant, ReservationTable, ReserveOutcome};

pub struct RelayState {
    config: RelayConfig,
    reservations: Mutex<ReservationTable>,
    circuits: Mutex<CircuitRegistry>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            reservations: Mutex::new(ReservationTable::new(&config)),
            circuits: Mutex::new(CircuitRegistry::new(&config)),
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn reserve(&self, peer: PeerId, now: Instant) -> Result<ReservationGrant, DenyReason> {
        self.reservations.lock().reserve(peer, now)
    }

    /// Admit a circuit from `source` to `target`.
    ///
    /// The returned ticket keeps the circuit registered until dropped.
    pub fn admit_circuit(
        self: &Arc<Self>,
        source: PeerId,
        target: PeerId,
        now: Instant,
    ) -> Result<CircuitTicket, DenyReason> {
        if source == target {
            return Err(DenyReason::PermissionDenied);
        }

        let reservations = self.reservations.lock();
        let reservation = reservations
            .get_live(&target, now)
            .ok_or(DenyReason::NoReservation)?;
        let limit = reservation.limit;
        if limit.is_some_and(|limit| limit.is_exhausted()) {
            return Err(DenyReason::ResourceLimitExceeded);
        }
        let id = self.circuits.lock().admit(source, target, limit, now)?;
        drop(reservations);

        Ok(CircuitTicket {
            state: Arc::clone(self),
            id,
            limit,
        })
    }

    /// Drop the reservation of a peer that disconnected.
    pub fn release_peer(&self, peer: &PeerId) -> bool {
        self.reservations.lock().release(peer).is_some()
    }

    pub fn sweep(&self, now: Instant) -> Vec<PeerId> {
        self.reservations.lock().sweep(now)
    }

    pub fn reservation(&self, peer: &PeerId, now: Instant) -> Option<Reservation> {
        self.reservations.lock().get_live(peer, now).cloned()
    }

    pub fn live_reservations(&self, now: Instant) -> usize {
        self.reservations.lock().live_count(now)
    }

    pub fn active_circuits(&self) -> usize {
        self.circuits.lock().len()
    }
}

/// Registration of one live circuit; removes itself from the registry on drop.
pub struct CircuitTicket {
    state: Arc<RelayState>,
    id: CircuitId,
    limit: Option<CircuitLimit>,
}

impl CircuitTicket {
    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn limit(&self) -> Option<CircuitLimit> {
        self.limit
    }
}

impl Drop for CircuitTicket {
    fn drop(&mut self) {
        self.state.circuits.lock().remove(self.id);
    }
}

/// Current time on the runtime clock, so a paused test runtime drives expiry.
pub fn current_instant() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Spawn the background pass that purges expired reservations. Circuits
/// already running are left alone.
pub fn spawn_expiry_sweep(state: Arc<RelayState>) -> JoinHandle<()> {
    let period = state.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = state.sweep(current_instant());
            if !expired.is_empty() {
                debug!(count = expired.len(), "Swept expired relay reservations");
            }
        }
    })
}

/// Opens stop-protocol streams to reserved peers over their existing
/// connection.
#[async_trait]
pub trait StopDialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open_stop(&self, target: PeerId) -> Result<Self::Stream, RelayError>;
}

/// [`StopDialer`] backed by the swarm's stream control handle.
pub struct StreamControlDialer {
    control: Mutex<Control>,
}

impl StreamControlDialer {
    pub fn new(control: Control) -> Self {
        Self {
            control: Mutex::new(control),
        }
    }
}

#[async_trait]
impl StopDialer for StreamControlDialer {
    type Stream = libp2p::Stream;

    async fn open_stop(&self, target: PeerId) -> Result<Self::Stream, RelayError> {
        let mut control = self.control.lock().clone();
        control
            .open_stream(target, RELAY_STOP_PROTOCOL)
            .await
            .map_err(|err| match err {
                OpenStreamError::UnsupportedProtocol(protocol) => {
                    RelayError::ProtocolMismatch(ProtocolMismatch(protocol.to_string()))
                }
                other => RelayError::OpenStream {
                    peer: target,
                    reason: other.to_string(),
                },
            })
    }
}

/// What happened to one hop stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopOutcome {
    Reserved(ReservationGrant),
    Denied(DenyReason),
    Relayed { circuit: CircuitId, stats: SpliceStats },
}

pub struct RelayServer<D> {
    state: Arc<RelayState>,
    dialer: D,
    advertised: Arc<RwLock<Vec<Multiaddr>>>,
}

impl<D: StopDialer> RelayServer<D> {
    /// `advertised` is the relay's current address set, handed to peers that
    /// reserve so they can publish relayed addresses.
    pub fn new(state: Arc<RelayState>, dialer: D, advertised: Arc<RwLock<Vec<Multiaddr>>>) -> Self {
        Self {
            state,
            dialer,
            advertised,
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Serve inbound hop streams until the sequence ends. Each stream is
    /// handled in its own task; tasks are aborted if this future is dropped.
    pub async fn run<I, S>(self: Arc<Self>, mut incoming: I)
    where
        I: Stream<Item = (PeerId, S)> + Unpin,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                next = incoming.next() => {
                    let Some((peer, stream)) = next else { break };
                    let server = Arc::clone(&self);
                    tasks.spawn(async move {
                        match server.handle_hop(peer, stream).await {
                            Ok(outcome) => debug!(%peer, ?outcome, "Hop stream finished"),
                            Err(err) => debug!(%peer, error = %err, "Hop stream failed"),
                        }
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Handle one inbound hop stream opened by `source`.
    pub async fn handle_hop<S>(&self, source: PeerId, mut stream: S) -> Result<HopOutcome, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timeout = self.state.config().request_timeout;
        let request = match tokio::time::timeout(timeout, read_message::<_, HopRequest>(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(RelayError::Malformed(reason))) => {
                deny(&mut stream, DenyReason::MalformedMessage).await;
                return Err(RelayError::Malformed(reason));
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(RelayError::Timeout),
        };

        match request {
            HopRequest::Reserve => self.handle_reserve(source, stream).await,
            HopRequest::Connect { peer } => self.handle_connect(source, peer, stream).await,
        }
    }

    async fn handle_reserve<S>(&self, source: PeerId, mut stream: S) -> Result<HopOutcome, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let now = current_instant();
        let grant = match self.state.reserve(source, now) {
            Ok(grant) => grant,
            Err(reason) => {
                debug!(peer = %source, %reason, "Relay reservation denied");
                deny(&mut stream, reason).await;
                return Ok(HopOutcome::Denied(reason));
            }
        };

        let response = HopResponse::Reserved {
            ttl_secs: grant.remaining(now).as_secs(),
            addrs: self.advertised.read().clone(),
            limit: grant.limit,
        };
        if let Err(err) = write_message(&mut stream, &response).await {
            // A renewal keeps the slot the peer already knew about.
            if grant.outcome == ReserveOutcome::Created {
                self.state.release_peer(&source);
            }
            debug!(peer = %source, error = %err, "Failed to acknowledge reservation");
            return Err(err);
        }
        info!(peer = %source, outcome = ?grant.outcome, "Relay reservation accepted");

        self.hold_reservation(source, &mut stream).await;
        let _ = stream.close().await;
        Ok(HopOutcome::Reserved(grant))
    }

    /// Keep the hop stream open while `peer` holds a live reservation. The
    /// open stream stops the connection from being closed as idle, so stop
    /// streams can still reach the peer. Returns once the reservation lapses
    /// or the peer closes its end.
    async fn hold_reservation<S>(&self, peer: PeerId, stream: &mut S)
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 1];
        loop {
            let now = current_instant();
            let Some(reservation) = self.state.reservation(&peer, now) else {
                return;
            };
            let remaining = reservation.expires_at().saturating_duration_since(now);
            tokio::select! {
                _ = stream.read(&mut buf) => return,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn handle_connect<S>(
        &self,
        source: PeerId,
        target: PeerId,
        mut stream: S,
    ) -> Result<HopOutcome, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ticket = match self.state.admit_circuit(source, target, current_instant()) {
            Ok(ticket) => ticket,
            Err(reason) => {
                debug!(%source, %target, %reason, "Circuit request denied");
                deny(&mut stream, reason).await;
                return Ok(HopOutcome::Denied(reason));
            }
        };

        let stop = match self.open_stop(source, target, ticket.limit()).await {
            Ok(stop) => stop,
            Err(err) => {
                warn!(%source, %target, error = %err, "Failed to reach reserved peer");
                deny(&mut stream, DenyReason::ConnectionFailed).await;
                return Ok(HopOutcome::Denied(DenyReason::ConnectionFailed));
            }
        };

        write_message(
            &mut stream,
            &HopResponse::Connected {
                limit: ticket.limit(),
            },
        )
        .await?;

        let circuit = ticket.id();
        info!(circuit, %source, %target, "Relayed circuit established");
        let (stats, result) = splice(stream, stop, ticket.limit()).await;
        drop(ticket);
        info!(
            circuit,
            forwarded = stats.forwarded,
            returned = stats.returned,
            "Relayed circuit closed"
        );

        result.map(|()| HopOutcome::Relayed { circuit, stats })
    }

    async fn open_stop(
        &self,
        source: PeerId,
        target: PeerId,
        limit: Option<CircuitLimit>,
    ) -> Result<D::Stream, RelayError> {
        let mut stop = self.dialer.open_stop(target).await?;
        write_message(&mut stop, &StopRequest::Connect { peer: source, limit }).await?;

        let timeout = self.state.config().request_timeout;
        match tokio::time::timeout(timeout, read_message::<_, StopResponse>(&mut stop)).await {
            Ok(Ok(StopResponse::Accepted)) => Ok(stop),
            Ok(Ok(StopResponse::Refused { reason })) => Err(RelayError::Denied(reason)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RelayError::Timeout),
        }
    }
}

async fn deny<S>(stream: &mut S, reason: DenyReason)
where
    S: AsyncWrite + Unpin,
{
    let _ = write_message(stream, &HopResponse::Denied { reason }).await;
    let _ = stream.close().await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    use super::*;
    use crate::client::{accept_stop, request_circuit, request_reservation};
    use crate::reservation::ReserveOutcome;

    type Pipe = Compat<DuplexStream>;

    /// Hands the far end of each stop stream to whoever registered the target.
    #[derive(Default)]
    struct PipeDialer {
        targets: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Pipe>>>,
    }

    impl PipeDialer {
        fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<Pipe> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.targets.lock().insert(peer, tx);
            rx
        }
    }

    #[async_trait]
    impl StopDialer for Arc<PipeDialer> {
        type Stream = Pipe;

        async fn open_stop(&self, target: PeerId) -> Result<Pipe, RelayError> {
            let unreachable = || RelayError::OpenStream {
                peer: target,
                reason: "not connected".into(),
            };
            let sender = self.targets.lock().get(&target).cloned().ok_or_else(unreachable)?;
            let (relay_end, peer_end) = tokio::io::duplex(4096);
            sender.send(peer_end.compat()).map_err(|_| unreachable())?;
            Ok(relay_end.compat())
        }
    }

    fn server(config: RelayConfig) -> (Arc<RelayServer<Arc<PipeDialer>>>, Arc<PipeDialer>) {
        let state = Arc::new(RelayState::new(config).unwrap());
        let dialer = Arc::new(PipeDialer::default());
        let advertised = Arc::new(RwLock::new(vec![
            "/ip4/198.51.100.7/tcp/9001/ws".parse().unwrap(),
        ]));
        (
            Arc::new(RelayServer::new(state, Arc::clone(&dialer), advertised)),
            dialer,
        )
    }

    /// Open a hop stream from `peer`, returning the peer's end and the
    /// relay-side handler.
    fn open_hop(
        server: &Arc<RelayServer<Arc<PipeDialer>>>,
        peer: PeerId,
    ) -> (Pipe, tokio::task::JoinHandle<Result<HopOutcome, RelayError>>) {
        let (peer_end, relay_end) = tokio::io::duplex(4096);
        let server = Arc::clone(server);
        let handler = tokio::spawn(async move { server.handle_hop(peer, relay_end.compat()).await });
        (peer_end.compat(), handler)
    }

    async fn reserve(server: &Arc<RelayServer<Arc<PipeDialer>>>, peer: PeerId) -> Result<crate::client::ReservationAccepted, RelayError> {
        let (mut stream, handler) = open_hop(server, peer);
        let result = request_reservation(&mut stream).await;
        // The relay holds the stream open until the peer lets go.
        drop(stream);
        handler.await.unwrap().unwrap();
        result
    }

    #[tokio::test]
    async fn reserved_peer_receives_relayed_ping() {
        let (server, dialer) = server(RelayConfig::default());
        let peer_a = PeerId::random();
        let peer_x = PeerId::random();
        let mut stop_streams = dialer.register(peer_a);

        let accepted = reserve(&server, peer_a).await.unwrap();
        assert_eq!(accepted.ttl, Duration::from_secs(600));
        assert_eq!(accepted.addrs.len(), 1);
        assert_eq!(accepted.limit, None);

        let target = tokio::spawn(async move {
            let stop = stop_streams.recv().await.unwrap();
            let mut connection = accept_stop(stop).await.unwrap();
            let mut ping = [0u8; 4];
            connection.stream.read_exact(&mut ping).await.unwrap();
            connection.stream.write_all(b"pong").await.unwrap();
            connection.stream.close().await.unwrap();
            (connection.peer, ping)
        });

        let (stream, handler) = open_hop(&server, peer_x);
        let mut connection = request_circuit(stream, peer_a).await.unwrap();
        connection.stream.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        connection.stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        let (source, ping) = target.await.unwrap();
        assert_eq!(source, peer_x);
        assert_eq!(&ping, b"ping");

        drop(connection);
        let outcome = tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match outcome {
            HopOutcome::Relayed { stats, .. } => {
                assert_eq!(stats.forwarded, 4);
                assert_eq!(stats.returned, 4);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(server.state().active_circuits(), 0);
    }

    #[tokio::test]
    async fn connect_without_reservation_is_denied() {
        let (server, _dialer) = server(RelayConfig::default());
        let (stream, handler) = open_hop(&server, PeerId::random());

        let err = request_circuit(stream, PeerId::random()).await.unwrap_err();
        assert!(matches!(err, RelayError::Denied(DenyReason::NoReservation)));
        assert_eq!(
            handler.await.unwrap().unwrap(),
            HopOutcome::Denied(DenyReason::NoReservation)
        );
        assert_eq!(server.state().active_circuits(), 0);
    }

    #[tokio::test]
    async fn connecting_to_self_is_refused() {
        let (server, dialer) = server(RelayConfig::default());
        let peer = PeerId::random();
        let _stop_streams = dialer.register(peer);
        reserve(&server, peer).await.unwrap();

        let (stream, _handler) = open_hop(&server, peer);
        let err = request_circuit(stream, peer).await.unwrap_err();
        assert!(matches!(err, RelayError::Denied(DenyReason::PermissionDenied)));
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_renewal_is_free() {
        let (server, _dialer) = server(RelayConfig {
            max_reservations: 1,
            ..RelayConfig::default()
        });
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();

        reserve(&server, peer_a).await.unwrap();
        let err = reserve(&server, peer_b).await.unwrap_err();
        assert!(matches!(err, RelayError::Denied(DenyReason::ReservationRefused)));

        let renewed = server.state().reserve(peer_a, Instant::now()).unwrap();
        assert_eq!(renewed.outcome, ReserveOutcome::Renewed);
        assert_eq!(server.state().live_reservations(Instant::now()), 1);
    }

    #[tokio::test]
    async fn unreachable_target_fails_the_circuit() {
        let (server, _dialer) = server(RelayConfig::default());
        let target = PeerId::random();
        reserve(&server, target).await.unwrap();

        let (stream, handler) = open_hop(&server, PeerId::random());
        let err = request_circuit(stream, target).await.unwrap_err();
        assert!(matches!(err, RelayError::Denied(DenyReason::ConnectionFailed)));
        assert_eq!(
            handler.await.unwrap().unwrap(),
            HopOutcome::Denied(DenyReason::ConnectionFailed)
        );
        assert_eq!(server.state().active_circuits(), 0);
    }

    #[tokio::test]
    async fn disconnect_releases_reservation() {
        let (server, dialer) = server(RelayConfig::default());
        let target = PeerId::random();
        let _stop_streams = dialer.register(target);
        reserve(&server, target).await.unwrap();

        assert!(server.state().release_peer(&target));
        let (stream, _handler) = open_hop(&server, PeerId::random());
        let err = request_circuit(stream, target).await.unwrap_err();
        assert!(matches!(err, RelayError::Denied(DenyReason::NoReservation)));
    }

    #[tokio::test]
    async fn exhausted_limit_refuses_circuits() {
        let (server, dialer) = server(RelayConfig {
            enforce_transfer_limit: true,
            max_circuit_bytes: 0,
            ..RelayConfig::default()
        });
        let target = PeerId::random();
        let _stop_streams = dialer.register(target);
        reserve(&server, target).await.unwrap();

        let (stream, _handler) = open_hop(&server, PeerId::random());
        let err = request_circuit(stream, target).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Denied(DenyReason::ResourceLimitExceeded)
        ));
    }

    #[tokio::test]
    async fn malformed_request_is_answered_and_rejected() {
        let (server, _dialer) = server(RelayConfig::default());
        let (mut stream, handler) = open_hop(&server, PeerId::random());

        let body = b"not json";
        stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let response: HopResponse = read_message(&mut stream).await.unwrap();
        assert_eq!(
            response,
            HopResponse::Denied {
                reason: DenyReason::MalformedMessage
            }
        );
        assert!(matches!(
            handler.await.unwrap(),
            Err(RelayError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn run_serves_streams_until_incoming_ends() {
        let (server, _dialer) = server(RelayConfig::default());
        let peer = PeerId::random();
        let (client_end, relay_end) = tokio::io::duplex(4096);
        let incoming = futures::stream::iter(vec![(peer, relay_end.compat())]);

        let runner = tokio::spawn(Arc::clone(&server).run(incoming));
        let mut client = client_end.compat();
        request_reservation(&mut client).await.unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();

        assert!(server.state().reservation(&peer, Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_purges_stale_reservations() {
        let state = Arc::new(
            RelayState::new(RelayConfig {
                reservation_ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(30),
                ..RelayConfig::default()
            })
            .unwrap(),
        );
        let peer = PeerId::random();
        state.reserve(peer, current_instant()).unwrap();
        let sweeper = spawn_expiry_sweep(Arc::clone(&state));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state.reservations.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(60 + 30)).await;
        assert!(state.reservations.lock().is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn reservation_stream_stays_open_until_peer_closes() {
        let (server, _dialer) = server(RelayConfig::default());
        let peer = PeerId::random();
        let (mut stream, handler) = open_hop(&server, peer);

        request_reservation(&mut stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handler.is_finished());

        drop(stream);
        let outcome = tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, HopOutcome::Reserved(_)));
        assert!(server.state().reservation(&peer, current_instant()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_stream_closes_when_reservation_lapses() {
        let (server, _dialer) = server(RelayConfig {
            reservation_ttl: Duration::from_secs(60),
            ..RelayConfig::default()
        });
        let (mut stream, handler) = open_hop(&server, PeerId::random());
        request_reservation(&mut stream).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(120), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert!(matches!(
            handler.await.unwrap().unwrap(),
            HopOutcome::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn unacknowledged_reservation_is_rolled_back() {
        let (server, _dialer) = server(RelayConfig::default());
        let peer = PeerId::random();
        let (peer_end, relay_end) = tokio::io::duplex(4096);
        let mut peer_end = peer_end.compat();
        write_message(&mut peer_end, &HopRequest::Reserve).await.unwrap();
        // The request is still buffered, but the acknowledgement has nowhere to go.
        drop(peer_end);

        let err = server
            .handle_hop(peer, relay_end.compat())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Stream(_)));
        assert!(server.state().reservation(&peer, current_instant()).is_none());
        assert_eq!(server.state().live_reservations(current_instant()), 0);
    }
}
