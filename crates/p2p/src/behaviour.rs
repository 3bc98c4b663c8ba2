//! Composed network behaviour of the relay node.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{autonat, gossipsub, identify, ping, PeerId};
use relay_network::ReachabilityConfig;

use crate::error::NodeError;

/// Every protocol the relay speaks. Relay hop and stop streams ride on the
/// generic `stream` behaviour.
#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub autonat: autonat::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl RelayBehaviour {
    pub fn new(
        keypair: &Keypair,
        protocol_version: &str,
        agent_version: &str,
        reachability: &ReachabilityConfig,
    ) -> Result<Self, NodeError> {
        let peer_id = PeerId::from(keypair.public());

        let message_id_fn = |message: &gossipsub::Message| {
            let digest = blake3::hash(&message.data);
            gossipsub::MessageId::from(digest.as_bytes())
        };
        let gossip_config = gossipsub::ConfigBuilder::default()
            .message_id_fn(message_id_fn)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .heartbeat_interval(Duration::from_secs(4))
            .build()
            .map_err(|err| NodeError::Behaviour(format!("gossipsub config: {err}")))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossip_config,
        )
        .map_err(|err| NodeError::Behaviour(format!("gossipsub: {err}")))?;

        let identify = identify::Behaviour::new(
            identify::Config::new(protocol_version.to_string(), keypair.public())
                .with_agent_version(agent_version.to_string())
                .with_push_listen_addr_updates(true),
        );

        let autonat = autonat::Behaviour::new(peer_id, autonat_config(reachability));

        Ok(Self {
            identify,
            ping: ping::Behaviour::default(),
            autonat,
            gossipsub,
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}

fn autonat_config(reachability: &ReachabilityConfig) -> autonat::Config {
    autonat::Config {
        boot_delay: reachability.boot_delay,
        refresh_interval: reachability.refresh_interval,
        retry_interval: reachability.retry_interval,
        confidence_max: reachability.confirmations,
        only_global_ips: reachability.only_global_ips,
        ..autonat::Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autonat_follows_reachability_settings() {
        let reachability = ReachabilityConfig {
            confirmations: 3,
            boot_delay: Duration::from_secs(1),
            only_global_ips: false,
            ..ReachabilityConfig::default()
        };
        let config = autonat_config(&reachability);
        assert_eq!(config.confidence_max, 3);
        assert_eq!(config.boot_delay, Duration::from_secs(1));
        assert!(!config.only_global_ips);
    }

    #[test]
    fn behaviour_builds_with_fresh_key() {
        let keypair = Keypair::generate_ed25519();
        assert!(RelayBehaviour::new(
            &keypair,
            "/relay-node/1.0.0",
            "relay-node/test",
            &ReachabilityConfig::default(),
        )
        .is_ok());
    }
}
