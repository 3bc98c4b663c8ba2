//! Relay node orchestrator.
//!
//! Builds the transport stack and composed behaviour from a loaded identity,
//! binds the configured listeners, and drives the swarm from one background
//! task. Relay hop streams are served by a separate task that owns one child
//! task per stream, so a slow circuit never stalls the swarm.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, Swarm, SwarmEvent};
use libp2p::{autonat, gossipsub, identify, Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use relay_circuit::{spawn_expiry_sweep, RelayConfig, RelayServer, RelayState, StreamControlDialer};
use relay_network::{
    build_transport, dial_failure, recognised_services, DialAttempt, PeerIdentity, ProbeOutcome,
    Reachability, ReachabilityConfig, ReachabilityTracker, TransportConfig, TransportError,
    TransportKind, IDENTIFY_PROTOCOL_VERSION, RELAY_HOP_PROTOCOL,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::behaviour::{RelayBehaviour, RelayBehaviourEvent};
use crate::discovery::{DiscoveryFeed, DiscoveryMessage, PUBSUB_PEER_DISCOVERY};
use crate::error::{ListenFailure, NodeError};

pub const DEFAULT_PORT: u16 = 9001;

/// `/ip4/0.0.0.0/tcp/<port>/ws`
pub fn default_listen_address(port: u16) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
        .with(Protocol::Tcp(port))
        .with(Protocol::Ws(Cow::Borrowed("/")))
}

/// Everything the orchestrator needs, built once by the process shell.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: Vec<Multiaddr>,
    /// Advertised but never bound, e.g. a TLS-terminating proxy in front of
    /// the node.
    pub announce: Vec<Multiaddr>,
    pub transports: TransportConfig,
    pub relay: RelayConfig,
    pub reachability: ReachabilityConfig,
    pub discovery_topic: String,
    pub protocol_version: String,
    pub agent_version: String,
    pub idle_connection_timeout: Duration,
    /// How long startup waits for each listener to report a bound address.
    pub listen_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: vec![default_listen_address(DEFAULT_PORT)],
            announce: Vec::new(),
            transports: TransportConfig::default(),
            relay: RelayConfig::default(),
            reachability: ReachabilityConfig::default(),
            discovery_topic: PUBSUB_PEER_DISCOVERY.to_string(),
            protocol_version: IDENTIFY_PROTOCOL_VERSION.to_string(),
            agent_version: format!("relay-node/{}", env!("CARGO_PKG_VERSION")),
            idle_connection_timeout: Duration::from_secs(60),
            listen_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Bound(Vec<Multiaddr>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerReport {
    /// Address as configured.
    pub address: Multiaddr,
    pub status: ListenerStatus,
}

/// What the node ended up with after startup.
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub peer_id: PeerId,
    /// Transports this node registered.
    pub transports: Vec<TransportKind>,
    pub listeners: Vec<ListenerReport>,
    pub announce: Vec<Multiaddr>,
    /// Full multiaddrs (with `/p2p/<id>`) other peers should dial.
    pub reachable: Vec<Multiaddr>,
}

impl StartupReport {
    pub fn bound_addresses(&self) -> Vec<Multiaddr> {
        self.listeners
            .iter()
            .filter_map(|listener| match &listener.status {
                ListenerStatus::Bound(addrs) => Some(addrs.clone()),
                ListenerStatus::Failed(_) => None,
            })
            .flatten()
            .collect()
    }
}

enum Command {
    Dial {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        rejected: Vec<DialAttempt>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// A running relay node.
pub struct RelayNode {
    peer_id: PeerId,
    report: StartupReport,
    announce: Vec<Multiaddr>,
    transports: TransportConfig,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    reachability: Arc<Mutex<ReachabilityTracker>>,
    relay: Arc<RelayState>,
    control: libp2p_stream::Control,
    command_tx: mpsc::UnboundedSender<Command>,
    discovery_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryMessage>>>,
    shutdown_grace: Duration,
    swarm_task: Option<JoinHandle<()>>,
    server_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl RelayNode {
    /// Bind listeners and start serving.
    ///
    /// Individual listener failures are reported in the [`StartupReport`];
    /// startup only fails when no listener could be bound at all.
    pub async fn start(identity: PeerIdentity, config: NodeConfig) -> Result<Self, NodeError> {
        let relay = Arc::new(RelayState::new(config.relay.clone())?);
        config.transports.validate_announce(&config.announce)?;

        let keypair = identity.keypair().clone();
        let peer_id = identity.peer_id();
        let transports = config.transports.registered_kinds();
        info!(%peer_id, ?transports, "Initialising relay node");

        let transport = build_transport(&keypair, &config.transports)?;
        let behaviour = RelayBehaviour::new(
            &keypair,
            &config.protocol_version,
            &config.agent_version,
            &config.reachability,
        )?;
        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(config.idle_connection_timeout);
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);

        let topic = gossipsub::IdentTopic::new(config.discovery_topic.as_str());
        if let Err(err) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
            warn!(topic = %config.discovery_topic, "Failed to subscribe to discovery topic: {err}");
        }
        let (discovery, discovery_rx) = DiscoveryFeed::new(&topic);

        let mut control = swarm.behaviour().stream.new_control();
        let incoming_hops = control
            .accept(RELAY_HOP_PROTOCOL)
            .map_err(|err| NodeError::AlreadyRegistered(format!("{RELAY_HOP_PROTOCOL}: {err}")))?;

        let mut requested = Vec::with_capacity(config.listen.len());
        for address in &config.listen {
            let listener = config
                .transports
                .route(address)
                .map_err(|err| err.to_string())
                .and_then(|_| {
                    swarm
                        .listen_on(address.clone())
                        .map_err(|err| err.to_string())
                });
            requested.push((address.clone(), listener));
        }

        let listen_addrs = Arc::new(RwLock::new(Vec::new()));
        let advertised = Arc::new(RwLock::new(config.announce.clone()));
        let reachability = Arc::new(Mutex::new(ReachabilityTracker::new(&config.reachability)));

        let mut driver = SwarmDriver {
            swarm,
            relay: Arc::clone(&relay),
            reachability: Arc::clone(&reachability),
            listen_addrs: Arc::clone(&listen_addrs),
            advertised: Arc::clone(&advertised),
            announce: config.announce.clone(),
            discovery,
            pending_dials: HashMap::new(),
        };

        let listeners = driver
            .await_listeners(requested, config.listen_timeout)
            .await;
        for listener in &listeners {
            match &listener.status {
                ListenerStatus::Bound(addrs) => {
                    info!(address = %listener.address, bound = ?addrs, "Listener ready")
                }
                ListenerStatus::Failed(reason) => {
                    warn!(address = %listener.address, "Listener failed: {reason}")
                }
            }
        }
        if !listeners
            .iter()
            .any(|listener| matches!(listener.status, ListenerStatus::Bound(_)))
        {
            let failures = listeners
                .into_iter()
                .map(|listener| ListenFailure {
                    address: listener.address,
                    reason: match listener.status {
                        ListenerStatus::Failed(reason) => reason,
                        ListenerStatus::Bound(_) => String::new(),
                    },
                })
                .collect();
            return Err(NodeError::NoListeners { failures });
        }

        for address in &config.announce {
            driver.swarm.add_external_address(address.clone());
        }

        let report = StartupReport {
            peer_id,
            transports,
            announce: config.announce.clone(),
            reachable: reachable_addresses(peer_id, &config.announce, &listen_addrs.read()),
            listeners,
        };

        let server = Arc::new(RelayServer::new(
            Arc::clone(&relay),
            StreamControlDialer::new(control.clone()),
            advertised,
        ));
        let server_task = tokio::spawn(server.run(incoming_hops));
        let sweep_task = spawn_expiry_sweep(Arc::clone(&relay));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let swarm_task = tokio::spawn(driver.run(command_rx));

        Ok(Self {
            peer_id,
            report,
            announce: config.announce,
            transports: config.transports,
            listen_addrs,
            reachability,
            relay,
            control,
            command_tx,
            discovery_rx: Mutex::new(Some(discovery_rx)),
            shutdown_grace: config.shutdown_grace,
            swarm_task: Some(swarm_task),
            server_task: Some(server_task),
            sweep_task: Some(sweep_task),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.report
    }

    /// Addresses currently bound by the listeners.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().clone()
    }

    /// Dialable addresses of this node: the announce set if configured,
    /// otherwise the bound listen addresses.
    pub fn reachable_addresses(&self) -> Vec<Multiaddr> {
        reachable_addresses(self.peer_id, &self.announce, &self.listen_addrs.read())
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability.lock().verdict(Instant::now())
    }

    pub fn relay_state(&self) -> &Arc<RelayState> {
        &self.relay
    }

    /// Handle for opening and accepting raw protocol streams on this node.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Take the discovery feed. Subsequent calls return `None`.
    pub fn take_discovery_receiver(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryMessage>> {
        self.discovery_rx.lock().take()
    }

    /// Connect to `peer`, trying `candidates` one at a time in order.
    ///
    /// Candidates no registered transport can handle are skipped and reported
    /// alongside the real failures if nothing succeeds.
    pub async fn dial(&self, peer: PeerId, candidates: Vec<Multiaddr>) -> Result<(), NodeError> {
        if candidates.is_empty() {
            return Err(TransportError::NoCandidates(peer).into());
        }
        let (addresses, rejected) = self.transports.partition_candidates(&candidates);
        if addresses.is_empty() {
            return Err(TransportError::DialFailed { attempts: rejected }.into());
        }

        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Dial {
                peer,
                addresses,
                rejected,
                reply,
            })
            .map_err(|_| NodeError::Stopped)?;
        response.await.map_err(|_| NodeError::Stopped)??;
        Ok(())
    }

    /// Stop the swarm, waiting up to the configured grace period before
    /// aborting it, then tear down the relay server.
    pub async fn shutdown(mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(mut swarm_task) = self.swarm_task.take() {
            if tokio::time::timeout(self.shutdown_grace, &mut swarm_task)
                .await
                .is_err()
            {
                warn!("Relay swarm did not stop within the grace period; aborting");
                swarm_task.abort();
            }
        }
        for task in [self.server_task.take(), self.sweep_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        info!(peer_id = %self.peer_id, "Relay node stopped");
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        let _ = self.command_tx.send(Command::Shutdown);
        for task in [self.server_task.take(), self.sweep_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

fn reachable_addresses(peer_id: PeerId, announce: &[Multiaddr], bound: &[Multiaddr]) -> Vec<Multiaddr> {
    let base = if announce.is_empty() { bound } else { announce };
    base.iter()
        .map(|address| address.clone().with_p2p(peer_id).unwrap_or_else(|address| address))
        .collect()
}

struct PendingDial {
    peer: PeerId,
    rejected: Vec<DialAttempt>,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

struct SwarmDriver {
    swarm: Swarm<RelayBehaviour>,
    relay: Arc<RelayState>,
    reachability: Arc<Mutex<ReachabilityTracker>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    advertised: Arc<RwLock<Vec<Multiaddr>>>,
    announce: Vec<Multiaddr>,
    discovery: DiscoveryFeed,
    pending_dials: HashMap<ConnectionId, PendingDial>,
}

impl SwarmDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        debug!("Shutting down relay swarm");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
            }
        }
        info!("Relay swarm task terminated");
    }

    /// Drive the swarm until every started listener has reported an address
    /// or closed, or `timeout` elapses.
    async fn await_listeners(
        &mut self,
        requested: Vec<(Multiaddr, Result<ListenerId, String>)>,
        timeout: Duration,
    ) -> Vec<ListenerReport> {
        let started: Vec<ListenerId> = requested
            .iter()
            .filter_map(|(_, listener)| listener.as_ref().ok().copied())
            .collect();
        let mut bound: HashMap<ListenerId, Vec<Multiaddr>> = HashMap::new();
        let mut closed: HashMap<ListenerId, String> = HashMap::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while started
            .iter()
            .any(|id| !bound.contains_key(id) && !closed.contains_key(id))
        {
            let Ok(event) = tokio::time::timeout_at(deadline, self.swarm.select_next_some()).await
            else {
                break;
            };
            match &event {
                SwarmEvent::NewListenAddr {
                    listener_id,
                    address,
                } => bound.entry(*listener_id).or_default().push(address.clone()),
                SwarmEvent::ListenerClosed {
                    listener_id,
                    reason,
                    ..
                } => {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(err) => err.to_string(),
                    };
                    closed.insert(*listener_id, reason);
                }
                _ => {}
            }
            self.handle_event(event);
        }

        requested
            .into_iter()
            .map(|(address, listener)| {
                let status = match listener {
                    Err(reason) => ListenerStatus::Failed(reason),
                    Ok(id) => match bound.remove(&id) {
                        Some(addrs) => ListenerStatus::Bound(addrs),
                        None => ListenerStatus::Failed(
                            closed
                                .remove(&id)
                                .unwrap_or_else(|| "timed out waiting for listener".to_string()),
                        ),
                    },
                };
                ListenerReport { address, status }
            })
            .collect()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial {
                peer,
                addresses,
                rejected,
                reply,
            } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addresses)
                    .override_dial_concurrency_factor(NonZeroU8::MIN)
                    .build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(
                            connection_id,
                            PendingDial {
                                peer,
                                rejected,
                                reply,
                            },
                        );
                    }
                    Err(err) => {
                        let _ = reply.send(Err(dial_failure(Some(peer), &err, rejected)));
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<RelayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
                self.listen_addrs.write().push(address);
                self.refresh_advertised();
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "Listen address expired");
                self.listen_addrs.write().retain(|known| known != &address);
                self.refresh_advertised();
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                match reason {
                    Ok(()) => debug!(?addresses, "Listener closed"),
                    Err(err) => warn!(?addresses, "Listener closed: {err}"),
                }
                self.listen_addrs
                    .write()
                    .retain(|known| !addresses.contains(known));
                self.refresh_advertised();
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener error: {error}");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!(%peer_id, address = %endpoint.get_remote_address(), "Connection established");
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let _ = pending.reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => match self.pending_dials.remove(&connection_id) {
                Some(pending) => {
                    let err = dial_failure(Some(pending.peer), &error, pending.rejected);
                    debug!(peer = %pending.peer, "Dial failed: {err}");
                    let _ = pending.reply.send(Err(err));
                }
                None => debug!(?peer_id, "Outgoing connection failed: {error}"),
            },
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(%send_back_addr, "Inbound connection failed: {error}");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(%peer_id, ?cause, "Connection closed");
                if num_established == 0 && self.relay.release_peer(&peer_id) {
                    info!(%peer_id, "Released reservation of disconnected peer");
                }
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Autonat(event)) => self.handle_autonat(event),
            SwarmEvent::Behaviour(RelayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let services = recognised_services(info.protocols.iter());
                debug!(%peer_id, agent = %info.agent_version, ?services, "Identified peer");
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.discovery.forward(propagation_source, message);
            }
            _ => {}
        }
    }

    fn handle_autonat(&mut self, event: autonat::Event) {
        let outcome = match event {
            autonat::Event::OutboundProbe(autonat::OutboundProbeEvent::Response {
                peer,
                address,
                ..
            }) => {
                debug!(%peer, %address, "Dial-back probe succeeded");
                Some(ProbeOutcome::Reachable)
            }
            autonat::Event::OutboundProbe(autonat::OutboundProbeEvent::Error {
                peer,
                error: autonat::OutboundProbeError::Response(autonat::ResponseError::DialError),
                ..
            }) => {
                debug!(?peer, "Dial-back probe could not reach us");
                Some(ProbeOutcome::Unreachable)
            }
            autonat::Event::OutboundProbe(autonat::OutboundProbeEvent::Error {
                peer, error, ..
            }) => {
                debug!(?peer, ?error, "Dial-back probe inconclusive");
                None
            }
            _ => None,
        };

        if let Some(outcome) = outcome {
            let now = Instant::now();
            let mut tracker = self.reachability.lock();
            let changed = tracker.record(outcome, now);
            let samples = tracker.fresh_samples(now);
            drop(tracker);
            match changed {
                Some(verdict) => info!(%verdict, samples, "Reachability changed"),
                None => debug!(?outcome, samples, "Recorded reachability probe"),
            }
        }
    }

    fn refresh_advertised(&self) {
        if self.announce.is_empty() {
            *self.advertised.write() = self.listen_addrs.read().clone();
        }
    }
}
