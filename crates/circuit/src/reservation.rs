//! Reservation table.
//!
//! Time is always passed in by the caller so liveness can be checked at exact
//! instants. A reservation created at `t0` with TTL `d` is live on `[t0, t0 + d)`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::PeerId;

use crate::config::{CircuitLimit, RelayConfig};
use crate::error::DenyReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub peer: PeerId,
    pub created_at: Instant,
    pub ttl: Duration,
    pub limit: Option<CircuitLimit>,
}

impl Reservation {
    pub fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Created,
    Renewed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationGrant {
    pub outcome: ReserveOutcome,
    pub expires_at: Instant,
    pub limit: Option<CircuitLimit>,
}

impl ReservationGrant {
    /// Time left on the reservation as seen at `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug)]
pub struct ReservationTable {
    max_reservations: usize,
    ttl: Duration,
    limit: Option<CircuitLimit>,
    entries: HashMap<PeerId, Reservation>,
}

impl ReservationTable {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            max_reservations: config.max_reservations,
            ttl: config.reservation_ttl,
            limit: config.circuit_limit(),
            entries: HashMap::new(),
        }
    }

    /// Create or renew the reservation of `peer`.
    ///
    /// Renewing a live reservation never counts against capacity. When two
    /// renewals race, the later timestamp wins regardless of arrival order.
    pub fn reserve(&mut self, peer: PeerId, now: Instant) -> Result<ReservationGrant, DenyReason> {
        if let Some(existing) = self.entries.get_mut(&peer) {
            if existing.is_live(now) {
                existing.created_at = existing.created_at.max(now);
                return Ok(ReservationGrant {
                    outcome: ReserveOutcome::Renewed,
                    expires_at: existing.expires_at(),
                    limit: existing.limit,
                });
            }
        }

        self.entries.retain(|_, reservation| reservation.is_live(now));
        if self.entries.len() >= self.max_reservations {
            return Err(DenyReason::ReservationRefused);
        }

        let reservation = Reservation {
            peer,
            created_at: now,
            ttl: self.ttl,
            limit: self.limit,
        };
        let grant = ReservationGrant {
            outcome: ReserveOutcome::Created,
            expires_at: reservation.expires_at(),
            limit: reservation.limit,
        };
        self.entries.insert(peer, reservation);
        Ok(grant)
    }

    pub fn get_live(&self, peer: &PeerId, now: Instant) -> Option<&Reservation> {
        self.entries
            .get(peer)
            .filter(|reservation| reservation.is_live(now))
    }

    pub fn release(&mut self, peer: &PeerId) -> Option<Reservation> {
        self.entries.remove(peer)
    }

    /// Drop every expired reservation and return whose they were.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .entries
            .values()
            .filter(|reservation| !reservation.is_live(now))
            .map(|reservation| reservation.peer)
            .collect();
        for peer in &expired {
            self.entries.remove(peer);
        }
        expired
    }

    pub fn live_count(&self, now: Instant) -> usize {
        self.entries
            .values()
            .filter(|reservation| reservation.is_live(now))
            .count()
    }

    /// Entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;

    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn table(max_reservations: usize) -> ReservationTable {
        ReservationTable::new(&RelayConfig {
            max_reservations,
            reservation_ttl: TTL,
            ..RelayConfig::default()
        })
    }

    #[test]
    fn capacity_renewal_and_expiry_scenario() {
        let mut table = table(1);
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let t0 = Instant::now();

        assert_eq!(
            table.reserve(peer_a, t0).unwrap().outcome,
            ReserveOutcome::Created
        );
        assert_eq!(
            table.reserve(peer_b, t0 + Duration::from_secs(1)),
            Err(DenyReason::ReservationRefused)
        );
        assert_eq!(
            table
                .reserve(peer_a, t0 + Duration::from_secs(2))
                .unwrap()
                .outcome,
            ReserveOutcome::Renewed
        );

        let after_ttl = t0 + Duration::from_secs(2) + TTL;
        assert_eq!(
            table.reserve(peer_b, after_ttl).unwrap().outcome,
            ReserveOutcome::Created
        );
        assert!(table.get_live(&peer_a, after_ttl).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn liveness_boundary_is_exclusive() {
        let mut table = table(4);
        let peer = PeerId::random();
        let t0 = Instant::now();
        table.reserve(peer, t0).unwrap();

        assert!(table.get_live(&peer, t0).is_some());
        assert!(table
            .get_live(&peer, t0 + TTL - Duration::from_nanos(1))
            .is_some());
        assert!(table.get_live(&peer, t0 + TTL).is_none());
    }

    #[test]
    fn renewal_resets_creation_time() {
        let mut table = table(4);
        let peer = PeerId::random();
        let t0 = Instant::now();
        table.reserve(peer, t0).unwrap();
        let grant = table.reserve(peer, t0 + Duration::from_secs(300)).unwrap();

        assert_eq!(grant.expires_at, t0 + Duration::from_secs(300) + TTL);
        assert!(table.get_live(&peer, t0 + TTL).is_some());
    }

    #[test]
    fn renewal_with_older_timestamp_keeps_later_one() {
        let mut table = table(4);
        let peer = PeerId::random();
        let t0 = Instant::now();
        table.reserve(peer, t0 + Duration::from_secs(5)).unwrap();
        table.reserve(peer, t0 + Duration::from_secs(2)).unwrap();

        let live = table.get_live(&peer, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(live.created_at, t0 + Duration::from_secs(5));
    }

    #[test]
    fn expired_entry_is_recreated_subject_to_capacity() {
        let mut table = table(1);
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let t0 = Instant::now();
        table.reserve(peer_a, t0).unwrap();
        table.reserve(peer_b, t0 + TTL).unwrap();

        assert_eq!(
            table.reserve(peer_a, t0 + TTL),
            Err(DenyReason::ReservationRefused)
        );
    }

    #[test]
    fn sweep_removes_only_expired_reservations() {
        let mut table = table(4);
        let stale = PeerId::random();
        let fresh = PeerId::random();
        let t0 = Instant::now();
        table.reserve(stale, t0).unwrap();
        table.reserve(fresh, t0 + Duration::from_secs(60)).unwrap();

        let removed = table.sweep(t0 + TTL);
        assert_eq!(removed, vec![stale]);
        assert_eq!(table.live_count(t0 + TTL), 1);
        assert!(table.get_live(&fresh, t0 + TTL).is_some());
    }

    #[test]
    fn release_frees_capacity() {
        let mut table = table(1);
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let t0 = Instant::now();
        table.reserve(peer_a, t0).unwrap();
        assert!(table.release(&peer_a).is_some());
        assert!(table.reserve(peer_b, t0).is_ok());
    }

    #[test]
    fn concurrent_renewals_leave_single_entry_with_later_timestamp() {
        let shared = Arc::new(Mutex::new(table(4)));
        let peer = PeerId::random();
        let t0 = Instant::now();
        let early = t0 + Duration::from_millis(10);
        let late = t0 + Duration::from_millis(20);

        let handles: Vec<_> = [late, early]
            .into_iter()
            .map(|at| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || shared.lock().reserve(peer, at))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let table = shared.lock();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_live(&peer, late).unwrap().created_at, late);
    }
}
