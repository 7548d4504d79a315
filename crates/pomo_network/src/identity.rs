//! Node identity: Ed25519 key material and the peer id derived from it.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NetworkError;

/// Number of SHA-256 bytes kept in a peer id.
const PEER_ID_BYTES: usize = 20;

/// Length of a persisted secret key file.
const SECRET_KEY_LEN: usize = 32;

/// A unique identifier for a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Derive the peer id for an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode(&digest[..PEER_ID_BYTES]))
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An Ed25519 signing keypair.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret: [u8; SECRET_KEY_LEN] = rand::random();
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Rebuild a keypair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let secret: [u8; SECRET_KEY_LEN] = bytes.try_into().map_err(|_| {
            NetworkError::Identity(format!(
                "expected {SECRET_KEY_LEN} key bytes, found {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    /// The 32-byte secret, for persistence.
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.signing.to_bytes()
    }

    /// The 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Check an Ed25519 signature made by `public_key` over `message`.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), NetworkError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| NetworkError::Handshake("malformed public key".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NetworkError::Handshake(format!("bad public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| NetworkError::Handshake(format!("malformed signature: {e}")))?;
    key.verify(message, &signature)
        .map_err(|e| NetworkError::Handshake(format!("signature mismatch: {e}")))
}

/// The full identity of a node: its keypair, derived id and display name.
#[derive(Debug)]
pub struct NodeIdentity {
    /// Unique peer identifier, derived from the public key.
    pub peer_id: PeerId,
    /// Human-readable name shown to room members.
    pub name: String,
    /// Software version string.
    pub version: String,
    keypair: Keypair,
}

impl NodeIdentity {
    /// Wrap an existing keypair.
    pub fn from_keypair(keypair: Keypair, name: impl Into<String>) -> Self {
        Self {
            peer_id: keypair.peer_id(),
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            keypair,
        }
    }

    /// Create an identity with a fresh, unpersisted keypair.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::from_keypair(Keypair::generate(), name)
    }

    /// The identity's keypair.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Load the secret key at `path`, or generate and persist a new one if
    /// the file does not exist.
    pub fn load_or_create(path: &Path, name: impl Into<String>) -> Result<Self, NetworkError> {
        if !path.exists() {
            let keypair = Keypair::generate();
            write_secret(path, &keypair.secret_bytes())?;
            tracing::info!(
                "New key pair generated and saved to {} (peer_id: {})",
                path.display(),
                keypair.peer_id()
            );
            return Ok(Self::from_keypair(keypair, name));
        }

        let data = std::fs::read(path)?;
        let keypair = Keypair::from_secret_bytes(&data)
            .map_err(|e| NetworkError::Identity(format!("{}: {e}", path.display())))?;
        Ok(Self::from_keypair(keypair, name))
    }
}

fn write_secret(path: &Path, secret: &[u8]) -> Result<(), NetworkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, secret)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
