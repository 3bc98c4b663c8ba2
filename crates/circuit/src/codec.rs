//! Hop and stop protocol messages.
//!
//! Every message is one frame: a big-endian `u32` length followed by that many
//! bytes of JSON.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{Multiaddr, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CircuitLimit;
use crate::error::{DenyReason, RelayError};

pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// Sent by a peer to the relay on the hop protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HopRequest {
    Reserve,
    Connect { peer: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HopResponse {
    Reserved {
        ttl_secs: u64,
        addrs: Vec<Multiaddr>,
        limit: Option<CircuitLimit>,
    },
    Connected {
        limit: Option<CircuitLimit>,
    },
    Denied {
        reason: DenyReason,
    },
}

/// Sent by the relay to the reserved peer on the stop protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopRequest {
    Connect {
        peer: PeerId,
        limit: Option<CircuitLimit>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopResponse {
    Accepted,
    Refused { reason: DenyReason },
}

pub async fn write_message<W, M>(io: &mut W, message: &M) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|err| RelayError::Malformed(err.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RelayError::FrameTooLarge(body.len()));
    }
    // Bounded by MAX_FRAME_LEN above.
    let len = body.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_message<R, M>(io: &mut R) -> Result<M, RelayError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut header = [0u8; 4];
    read_exact(io, &mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RelayError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    read_exact(io, &mut body).await?;
    serde_json::from_slice(&body).map_err(|err| RelayError::Malformed(err.to_string()))
}

async fn read_exact<R>(io: &mut R, buf: &mut [u8]) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    io.read_exact(buf).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => RelayError::UnexpectedEof,
        _ => RelayError::Stream(err),
    })
}
