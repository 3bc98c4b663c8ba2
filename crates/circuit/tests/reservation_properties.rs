use std::collections::HashSet;
use std::time::{Duration, Instant};

use libp2p::PeerId;
use proptest::prelude::*;
use relay_circuit::{DenyReason, RelayConfig, ReservationTable, ReserveOutcome};

const TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
enum Op {
    Reserve { peer: usize, advance_secs: u64 },
    Release { peer: usize },
    Sweep { advance_secs: u64 },
}

fn op(peers: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..peers, 0u64..40).prop_map(|(peer, advance_secs)| Op::Reserve { peer, advance_secs }),
        1 => (0..peers).prop_map(|peer| Op::Release { peer }),
        1 => (0u64..90).prop_map(|advance_secs| Op::Sweep { advance_secs }),
    ]
}

fn table(max_reservations: usize) -> ReservationTable {
    ReservationTable::new(&RelayConfig {
        max_reservations,
        reservation_ttl: Duration::from_secs(TTL_SECS),
        ..RelayConfig::default()
    })
}

proptest! {
    #[test]
    fn live_reservations_never_exceed_capacity(
        capacity in 1usize..6,
        ops in prop::collection::vec(op(10), 1..80),
    ) {
        let peers: Vec<PeerId> = (0..10).map(|_| PeerId::random()).collect();
        let mut table = table(capacity);
        let mut now = Instant::now();

        for op in ops {
            match op {
                Op::Reserve { peer, advance_secs } => {
                    now += Duration::from_secs(advance_secs);
                    let was_live = table.get_live(&peers[peer], now).is_some();
                    match table.reserve(peers[peer], now) {
                        Ok(grant) => {
                            let expected = if was_live { ReserveOutcome::Renewed } else { ReserveOutcome::Created };
                            prop_assert_eq!(grant.outcome, expected);
                            prop_assert!(table.get_live(&peers[peer], now).is_some());
                        }
                        Err(reason) => {
                            prop_assert_eq!(reason, DenyReason::ReservationRefused);
                            prop_assert!(!was_live);
                            prop_assert_eq!(table.live_count(now), capacity);
                        }
                    }
                }
                Op::Release { peer } => {
                    table.release(&peers[peer]);
                    prop_assert!(table.get_live(&peers[peer], now).is_none());
                }
                Op::Sweep { advance_secs } => {
                    now += Duration::from_secs(advance_secs);
                    table.sweep(now);
                    prop_assert_eq!(table.len(), table.live_count(now));
                }
            }
            prop_assert!(table.live_count(now) <= capacity);
        }
    }

    #[test]
    fn renewals_keep_one_entry_per_peer(offsets in prop::collection::vec(0u64..30, 1..40)) {
        let peer = PeerId::random();
        let mut table = table(4);
        let start = Instant::now();
        let mut latest = start;

        for offset in offsets {
            let at = start + Duration::from_secs(offset);
            table.reserve(peer, at).unwrap();
            latest = latest.max(at);
        }

        prop_assert_eq!(table.len(), 1);
        let live = table.get_live(&peer, latest).unwrap();
        prop_assert_eq!(live.created_at, latest);
        prop_assert!(table.get_live(&peer, latest + Duration::from_secs(TTL_SECS)).is_none());
    }

    #[test]
    fn sweep_returns_each_expired_peer_once(count in 1usize..12, elapsed in 0u64..120) {
        let peers: Vec<PeerId> = (0..count).map(|_| PeerId::random()).collect();
        let mut table = table(count);
        let start = Instant::now();
        for (i, peer) in peers.iter().enumerate() {
            table.reserve(*peer, start + Duration::from_secs(i as u64 * 5)).unwrap();
        }

        let now = start + Duration::from_secs(elapsed);
        let removed = table.sweep(now);
        let unique: HashSet<_> = removed.iter().collect();
        prop_assert_eq!(unique.len(), removed.len());
        prop_assert_eq!(removed.len() + table.len(), count);
        prop_assert!(table.sweep(now).is_empty());
    }
}
