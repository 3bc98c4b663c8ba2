//! Gossip peer discovery feed.
//!
//! The relay joins the discovery topic so announcements propagate through
//! it, and hands every message it sees to whoever consumes the feed. It never
//! publishes or inspects the payload itself.

use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::PeerId;
use tokio::sync::mpsc;

pub const PUBSUB_PEER_DISCOVERY: &str = "_peer-discovery._p2p._pubsub";

/// One message observed on the discovery topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    /// Original publisher, when the message is signed.
    pub source: Option<PeerId>,
    /// Peer that forwarded the message to us.
    pub propagation_source: PeerId,
    pub data: Vec<u8>,
}

pub(crate) struct DiscoveryFeed {
    topic: TopicHash,
    tx: mpsc::UnboundedSender<DiscoveryMessage>,
}

impl DiscoveryFeed {
    pub(crate) fn new(topic: &IdentTopic) -> (Self, mpsc::UnboundedReceiver<DiscoveryMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                topic: topic.hash(),
                tx,
            },
            rx,
        )
    }

    /// Forward `message` if it belongs to the discovery topic. Returns
    /// whether it was forwarded.
    pub(crate) fn forward(&self, propagation_source: PeerId, message: gossipsub::Message) -> bool {
        if message.topic != self.topic {
            return false;
        }
        // A dropped receiver just means nobody is listening.
        let _ = self.tx.send(DiscoveryMessage {
            source: message.source,
            propagation_source,
            data: message.data,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &IdentTopic, data: &[u8]) -> gossipsub::Message {
        gossipsub::Message {
            source: Some(PeerId::random()),
            data: data.to_vec(),
            sequence_number: Some(1),
            topic: topic.hash(),
        }
    }

    #[test]
    fn forwards_discovery_payload_unchanged() {
        let topic = IdentTopic::new(PUBSUB_PEER_DISCOVERY);
        let (feed, mut rx) = DiscoveryFeed::new(&topic);
        let forwarder = PeerId::random();
        let msg = message(&topic, b"\x0a\x02hi");
        let source = msg.source;

        assert!(feed.forward(forwarder, msg));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.source, source);
        assert_eq!(received.propagation_source, forwarder);
        assert_eq!(received.data, b"\x0a\x02hi");
    }

    #[test]
    fn ignores_other_topics() {
        let topic = IdentTopic::new(PUBSUB_PEER_DISCOVERY);
        let (feed, mut rx) = DiscoveryFeed::new(&topic);
        let other = IdentTopic::new("unrelated");

        assert!(!feed.forward(PeerId::random(), message(&other, b"x")));
        assert!(rx.try_recv().is_err());
    }
}
