//! Device identity: a persistent Ed25519 keypair, the device id derived
//! from it, and signed proofs for the gateway's challenge-response
//! handshake.
//!
//! The device id is the hex SHA-256 of the raw public key and must stay
//! stable across restarts for the gateway to recognize a returning
//! device, which is why the private key is persisted through a
//! [`KeyStore`].

use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use oc_protocol::DeviceAuth;

use crate::error::{GatewayError, Result};

/// Long-lived Ed25519 signing keypair identifying this device.
pub struct DeviceKeypair {
    signing: SigningKey,
}

impl DeviceKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a keypair from its raw 32-byte private key.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let raw: [u8; SECRET_KEY_LENGTH] = raw.try_into().map_err(|_| {
            GatewayError::Config(format!(
                "device key must be {SECRET_KEY_LENGTH} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&raw),
        })
    }

    /// Raw 32-byte private key, the persisted form.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing.to_bytes()
    }

    /// Raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Stable device identifier: hex SHA-256 of the raw public key.
    pub fn device_id(&self) -> String {
        device_id_from_public_key(&self.public_key_bytes())
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        self.signing.sign(payload)
    }
}

/// Derive a device id from raw public key bytes.
pub fn device_id_from_public_key(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Base64url without padding, the gateway's encoding for key and
/// signature bytes.
fn base64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// The v2 pipe-delimited canonical string that gets signed.
#[allow(clippy::too_many_arguments)]
pub fn build_signature_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: i64,
    token: &str,
    nonce: &str,
) -> String {
    let scopes_csv = scopes.join(",");
    format!(
        "v2|{device_id}|{client_id}|{client_mode}|{role}|{scopes_csv}|{signed_at_ms}|{token}|{nonce}"
    )
}

/// Build the complete signed device proof for a `connect` request.
pub fn build_device_auth(
    key: &DeviceKeypair,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    token: &str,
    nonce: &str,
) -> DeviceAuth {
    let device_id = key.device_id();
    let signed_at_ms = chrono::Utc::now().timestamp_millis();

    let payload = build_signature_payload(
        &device_id, client_id, client_mode, role, scopes, signed_at_ms, token, nonce,
    );
    let signature = key.sign(payload.as_bytes());

    DeviceAuth {
        id: device_id,
        public_key: base64url(&key.public_key_bytes()),
        signature: base64url(&signature.to_bytes()),
        signed_at: signed_at_ms,
        nonce: nonce.to_owned(),
    }
}

// ── Persistence ──────────────────────────────────────────────────────

/// Errors from a [`KeyStore`] backend.
#[derive(thiserror::Error, Debug)]
pub enum KeyStoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt key data: {0}")]
    Corrupt(String),
}

/// Persistence backend for the raw private key bytes.
///
/// The host decides where keys live (file, secret service, ...); the
/// client only defines the contract and the regenerate-on-corruption
/// fallback in [`load_or_create_keypair`].
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the raw private key, or `None` if nothing is persisted yet.
    async fn load(&self) -> std::result::Result<Option<Vec<u8>>, KeyStoreError>;
    /// Persist the raw private key.
    async fn save(&self, raw: &[u8]) -> std::result::Result<(), KeyStoreError>;
}

/// File-backed key store holding the hex-encoded raw private key.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self) -> std::result::Result<Option<Vec<u8>>, KeyStoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let raw = hex::decode(text.trim())
            .map_err(|err| KeyStoreError::Corrupt(format!("invalid hex: {err}")))?;
        Ok(Some(raw))
    }

    async fn save(&self, raw: &[u8]) -> std::result::Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, hex::encode(raw)).await?;
        Ok(())
    }
}

/// Load the persisted keypair, or generate and persist a new one.
///
/// Any load or deserialization failure regenerates silently (with a
/// warning): a device that lost its key re-registers as a new device
/// rather than being locked out.
pub async fn load_or_create_keypair(store: &dyn KeyStore) -> Result<DeviceKeypair> {
    match store.load().await {
        Ok(Some(raw)) => match DeviceKeypair::from_bytes(&raw) {
            Ok(key) => {
                tracing::debug!("loaded existing device keypair");
                return Ok(key);
            }
            Err(err) => {
                tracing::warn!(error = %err, "stored device key unusable, generating new one");
            }
        },
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to load stored device key, generating new one");
        }
    }

    let key = DeviceKeypair::generate();
    store
        .save(&key.to_bytes())
        .await
        .map_err(|err| GatewayError::Config(format!("failed to persist device key: {err}")))?;
    tracing::info!(device_id = %key.device_id(), "generated and saved new device keypair");
    Ok(key)
}
