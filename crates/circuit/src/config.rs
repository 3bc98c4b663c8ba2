use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-direction byte budget of a metered circuit (128 KiB).
pub const DEFAULT_MAX_CIRCUIT_BYTES: u64 = 1 << 17;
/// Default lifetime of a metered circuit.
pub const DEFAULT_MAX_CIRCUIT_DURATION: Duration = Duration::from_secs(2 * 60);

/// Transfer limit applied to a single relayed circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitLimit {
    /// Bytes allowed in each direction.
    pub max_bytes: u64,
    pub max_duration: Duration,
}

impl CircuitLimit {
    /// A limit that would be exceeded before any byte is forwarded.
    pub fn is_exhausted(&self) -> bool {
        self.max_bytes == 0 || self.max_duration.is_zero()
    }
}

/// Relay server limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_reservations: usize,
    pub reservation_ttl: Duration,
    /// Meter every circuit against `max_circuit_bytes` / `max_circuit_duration`.
    /// When false the relay runs unmetered.
    pub enforce_transfer_limit: bool,
    pub max_circuit_bytes: u64,
    pub max_circuit_duration: Duration,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    /// How often expired reservations are purged.
    pub sweep_interval: Duration,
    /// Deadline for the first message on a hop or stop stream.
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_reservations: 50,
            reservation_ttl: Duration::from_secs(10 * 60),
            enforce_transfer_limit: false,
            max_circuit_bytes: DEFAULT_MAX_CIRCUIT_BYTES,
            max_circuit_duration: DEFAULT_MAX_CIRCUIT_DURATION,
            max_circuits: 256,
            max_circuits_per_peer: 16,
            sweep_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_reservations must be greater than zero")]
    ZeroReservations,
    #[error("reservation_ttl must be greater than zero")]
    ZeroReservationTtl,
    #[error("max_circuits and max_circuits_per_peer must be greater than zero")]
    ZeroCircuits,
    #[error("sweep_interval must be greater than zero")]
    ZeroSweepInterval,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reservations == 0 {
            return Err(ConfigError::ZeroReservations);
        }
        if self.reservation_ttl.is_zero() {
            return Err(ConfigError::ZeroReservationTtl);
        }
        if self.max_circuits == 0 || self.max_circuits_per_peer == 0 {
            return Err(ConfigError::ZeroCircuits);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }

    /// Limit attached to new reservations, if enforcement is on.
    pub fn circuit_limit(&self) -> Option<CircuitLimit> {
        self.enforce_transfer_limit.then_some(CircuitLimit {
            max_bytes: self.max_circuit_bytes,
            max_duration: self.max_circuit_duration,
        })
    }
}
