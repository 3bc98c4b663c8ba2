//! Peer identity store.
//!
//! The relay keeps one ed25519 identity for its whole lifetime. It is either
//! decoded from a persisted JSON blob or freshly generated; a broken blob is
//! never fatal, the node falls back to a fresh key and says so loudly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::IdentityError;

/// Key pair plus the peer id derived from its public half.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

/// On-disk / environment representation of an identity.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "privKey", default)]
    priv_key: Option<String>,
    #[serde(rename = "pubKey", default, skip_serializing_if = "Option::is_none")]
    pub_key: Option<String>,
}

impl PeerIdentity {
    /// Generate a fresh ed25519 identity.
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Decode a persisted identity blob and check that every declared field
    /// agrees with the private key.
    pub fn from_json(raw: &str) -> Result<Self, IdentityError> {
        let persisted: PersistedIdentity = serde_json::from_str(raw)?;

        let encoded = persisted
            .priv_key
            .as_deref()
            .ok_or(IdentityError::MissingPrivateKey)?;
        let bytes = decode_field("privKey", encoded)?;
        let keypair =
            Keypair::from_protobuf_encoding(&bytes).map_err(|source| IdentityError::Key {
                field: "privKey",
                source,
            })?;
        let identity = Self::from_keypair(keypair);

        if let Some(id) = persisted.id.as_deref() {
            let declared: PeerId = id
                .parse()
                .map_err(|_| IdentityError::InvalidPeerId(id.to_string()))?;
            if declared != identity.peer_id {
                return Err(IdentityError::PeerIdMismatch {
                    declared,
                    derived: identity.peer_id,
                });
            }
        }

        if let Some(encoded) = persisted.pub_key.as_deref() {
            let bytes = decode_field("pubKey", encoded)?;
            let public = PublicKey::try_decode_protobuf(&bytes).map_err(|source| {
                IdentityError::Key {
                    field: "pubKey",
                    source,
                }
            })?;
            if public != identity.keypair.public() {
                return Err(IdentityError::PublicKeyMismatch);
            }
        }

        Ok(identity)
    }

    /// Encode the identity in the same format [`PeerIdentity::from_json`] reads.
    pub fn to_json(&self) -> Result<String, IdentityError> {
        let private = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|source| IdentityError::Key {
                field: "privKey",
                source,
            })?;
        let persisted = PersistedIdentity {
            id: Some(self.peer_id.to_string()),
            priv_key: Some(BASE64.encode(private)),
            pub_key: Some(BASE64.encode(self.public_key().encode_protobuf())),
        };
        Ok(serde_json::to_string(&persisted)?)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, IdentityError> {
    BASE64
        .decode(value.trim())
        .map_err(|source| IdentityError::Base64 { field, source })
}

/// Why a fresh identity had to be generated.
#[derive(Debug)]
pub enum GenerateReason {
    /// Nothing was configured.
    Missing,
    /// Something was configured but could not be used.
    Invalid(IdentityError),
}

/// Where the identity in an [`IdentityLoad`] came from.
#[derive(Debug)]
pub enum IdentitySource {
    Loaded,
    /// Generated and written to the given path, so it survives restarts.
    Persisted(PathBuf),
    /// Generated in memory only; the peer id changes on every restart.
    Generated(GenerateReason),
}

#[derive(Debug)]
pub struct IdentityLoad {
    pub identity: PeerIdentity,
    pub source: IdentitySource,
}

impl IdentityLoad {
    /// True when the peer id will not survive a restart.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.source, IdentitySource::Generated(_))
    }
}

/// Resolve the node identity from an optional serialized blob.
///
/// Never fails: a missing or malformed blob yields a fresh identity together
/// with a warning and a [`GenerateReason`] describing the fallback.
pub fn load_identity(raw: Option<&str>) -> IdentityLoad {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty());
    let Some(raw) = raw else {
        let identity = PeerIdentity::generate();
        warn!(
            peer_id = %identity.peer_id(),
            "No persisted identity configured; peer id will change on every restart"
        );
        return IdentityLoad {
            identity,
            source: IdentitySource::Generated(GenerateReason::Missing),
        };
    };

    match PeerIdentity::from_json(raw) {
        Ok(identity) => {
            info!(peer_id = %identity.peer_id(), "Loaded persistent peer identity");
            IdentityLoad {
                identity,
                source: IdentitySource::Loaded,
            }
        }
        Err(err) => {
            let identity = PeerIdentity::generate();
            warn!(
                error = %err,
                peer_id = %identity.peer_id(),
                "Failed to parse persisted identity, generated a new one"
            );
            IdentityLoad {
                identity,
                source: IdentitySource::Generated(GenerateReason::Invalid(err)),
            }
        }
    }
}

/// Load the identity stored at `path`, or generate one and persist it there.
///
/// A file that exists but cannot be decoded is left untouched and the node
/// falls back to an in-memory identity, same as [`load_identity`].
pub fn load_or_generate_identity_file(path: &Path) -> Result<IdentityLoad> {
    if path.is_file() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read identity file {}", path.display()))?;
        return Ok(load_identity(Some(&raw)));
    }

    let identity = PeerIdentity::generate();
    persist_identity(&identity, path)?;
    info!(
        peer_id = %identity.peer_id(),
        path = %path.display(),
        "Generated and persisted new peer identity"
    );
    Ok(IdentityLoad {
        identity,
        source: IdentitySource::Persisted(path.to_path_buf()),
    })
}

/// Atomically write the identity JSON to `path`.
pub fn persist_identity(identity: &PeerIdentity, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&parent)
        .with_context(|| format!("create identity dir {}", parent.display()))?;

    let encoded = identity
        .to_json()
        .map_err(|e| anyhow!("encode peer identity: {e}"))?;

    let mut temp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("create temp identity file in {}", parent.display()))?;
    temp.write_all(encoded.as_bytes())
        .with_context(|| format!("write temp identity file in {}", parent.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp identity file in {}", parent.display()))?;

    temp.persist(path).map_err(|e| {
        anyhow!(
            "persist identity to {} failed: {}",
            path.display(),
            e.error
        )
    })?;

    Ok(())
}
