//! Live circuit registry and the byte splice between the two halves of a
//! relayed circuit.

use std::collections::HashMap;
use std::time::Instant;

use futures::future::{self, Either};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::PeerId;

use crate::config::{CircuitLimit, RelayConfig};
use crate::error::{DenyReason, Direction, LimitKind, RelayError};

const SPLICE_BUFFER: usize = 16 * 1024;

pub type CircuitId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    pub id: CircuitId,
    pub source: PeerId,
    pub destination: PeerId,
    pub opened_at: Instant,
    pub limit: Option<CircuitLimit>,
}

impl CircuitInfo {
    fn involves(&self, peer: &PeerId) -> bool {
        self.source == *peer || self.destination == *peer
    }
}

/// Set of circuits currently being spliced.
#[derive(Debug)]
pub struct CircuitRegistry {
    max_circuits: usize,
    max_circuits_per_peer: usize,
    next_id: CircuitId,
    circuits: HashMap<CircuitId, CircuitInfo>,
}

impl CircuitRegistry {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            max_circuits: config.max_circuits,
            max_circuits_per_peer: config.max_circuits_per_peer,
            next_id: 0,
            circuits: HashMap::new(),
        }
    }

    pub fn admit(
        &mut self,
        source: PeerId,
        destination: PeerId,
        limit: Option<CircuitLimit>,
        now: Instant,
    ) -> Result<CircuitId, DenyReason> {
        if self.circuits.len() >= self.max_circuits
            || self.count_for(&source) >= self.max_circuits_per_peer
            || self.count_for(&destination) >= self.max_circuits_per_peer
        {
            return Err(DenyReason::ResourceLimitExceeded);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.circuits.insert(
            id,
            CircuitInfo {
                id,
                source,
                destination,
                opened_at: now,
                limit,
            },
        );
        Ok(id)
    }

    pub fn remove(&mut self, id: CircuitId) -> Option<CircuitInfo> {
        self.circuits.remove(&id)
    }

    pub fn get(&self, id: CircuitId) -> Option<&CircuitInfo> {
        self.circuits.get(&id)
    }

    pub fn count_for(&self, peer: &PeerId) -> usize {
        self.circuits
            .values()
            .filter(|circuit| circuit.involves(peer))
            .count()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}

/// Bytes moved in each direction of a splice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub forwarded: u64,
    pub returned: u64,
}

/// Copy bytes between `source` and `destination` in both directions until
/// either side finishes or fails, then close both.
///
/// The first direction to end decides the outcome; a clean EOF is `Ok`.
pub async fn splice<A, B>(
    source: A,
    destination: B,
    limit: Option<CircuitLimit>,
) -> (SpliceStats, Result<(), RelayError>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut source_read, mut source_write) = source.split();
    let (mut destination_read, mut destination_write) = destination.split();
    let mut stats = SpliceStats::default();

    let result = {
        let transfer = transfer(
            &mut source_read,
            &mut source_write,
            &mut destination_read,
            &mut destination_write,
            limit.map(|limit| limit.max_bytes),
            &mut stats,
        );
        match limit {
            Some(limit) => tokio::time::timeout(limit.max_duration, transfer)
                .await
                .unwrap_or(Err(RelayError::LimitExceeded(LimitKind::Duration))),
            None => transfer.await,
        }
    };

    // Whatever ended the splice, neither side may stay half-open.
    let _ = source_write.close().await;
    let _ = destination_write.close().await;

    (stats, result)
}

async fn transfer<SR, SW, DR, DW>(
    source_read: &mut SR,
    source_write: &mut SW,
    destination_read: &mut DR,
    destination_write: &mut DW,
    max_bytes: Option<u64>,
    stats: &mut SpliceStats,
) -> Result<(), RelayError>
where
    SR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
    DR: AsyncRead + Unpin,
    DW: AsyncWrite + Unpin,
{
    let forward = pump(
        source_read,
        destination_write,
        &mut stats.forwarded,
        max_bytes,
        Direction::SourceToDestination,
    );
    let backward = pump(
        destination_read,
        source_write,
        &mut stats.returned,
        max_bytes,
        Direction::DestinationToSource,
    );
    futures::pin_mut!(forward, backward);

    match future::select(forward, backward).await {
        Either::Left((result, _)) | Either::Right((result, _)) => result,
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &mut u64,
    max_bytes: Option<u64>,
    direction: Direction,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; SPLICE_BUFFER];
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|err| RelayError::splice(direction, err))?;
        if read == 0 {
            writer
                .flush()
                .await
                .map_err(|err| RelayError::splice(direction, err))?;
            return Ok(());
        }

        let allowed = match max_bytes {
            Some(max) => usize::try_from(max.saturating_sub(*counter))
                .unwrap_or(usize::MAX)
                .min(read),
            None => read,
        };

        writer
            .write_all(&buffer[..allowed])
            .await
            .map_err(|err| RelayError::splice(direction, err))?;
        writer
            .flush()
            .await
            .map_err(|err| RelayError::splice(direction, err))?;
        *counter += allowed as u64;

        if allowed < read {
            return Err(RelayError::LimitExceeded(LimitKind::Bytes));
        }
    }
}
