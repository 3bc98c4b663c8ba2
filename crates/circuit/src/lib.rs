//! Relay Circuit
//!
//! Reservation bookkeeping and circuit relaying for the relay node.
//!
//! ## Modules
//! - `reservation`: Bounded table of live reservations with TTL expiry
//! - `circuit`: Live circuit registry and the bidirectional byte splice
//! - `codec`: Hop and stop protocol messages and their framing
//! - `server`: Shared relay state, hop stream handling and expiry sweep
//! - `client`: Reserve, connect and accept relayed circuits as a peer
//! - `config`: Relay limits
//! - `error`: Denial reasons and relay errors

pub mod circuit;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod reservation;
pub mod server;

pub use circuit::{splice, CircuitId, CircuitInfo, CircuitRegistry, SpliceStats};
pub use client::{
    accept_stop, connect, request_circuit, request_reservation, reserve, HeldReservation,
    RelayedConnection, ReservationAccepted,
};
pub use codec::{HopRequest, HopResponse, StopRequest, StopResponse, MAX_FRAME_LEN};
pub use config::{CircuitLimit, ConfigError, RelayConfig};
pub use error::{DenyReason, Direction, LimitKind, RelayError};
pub use reservation::{Reservation, ReservationGrant, ReservationTable, ReserveOutcome};
pub use server::{
    current_instant, spawn_expiry_sweep, CircuitTicket, HopOutcome, RelayServer, RelayState,
    StopDialer, StreamControlDialer,
};
