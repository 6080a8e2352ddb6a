//! Local tunnel key material
//!
//! The X25519 key pair is generated once, base64-encoded the way WireGuard
//! configs expect, and persisted in the key/value store.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::KeyError;
use crate::store::{keys, KeyValueStore};

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Base64-encoded local key pair
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelCredentials {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for TunnelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCredentials")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Decode a base64 32-byte key
pub fn decode_key(value: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = BASE64.decode(value.trim()).ok()?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).ok()
}

/// Supplies the persisted local key pair
pub struct KeyStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Return the persisted key pair, generating one only if none exists.
    ///
    /// A missing or stale public key is re-derived from the private key.
    pub fn ensure_keys(&self) -> Result<TunnelCredentials, KeyError> {
        let stored_private: Option<String> = self.store.load(keys::PRIVATE_KEY);

        let Some(private_b64) = stored_private else {
            let (private, public) = generate_keypair();
            let credentials = TunnelCredentials {
                private_key: BASE64.encode(private),
                public_key: BASE64.encode(public),
            };
            self.store.save(keys::PRIVATE_KEY, &credentials.private_key)?;
            self.store.save(keys::PUBLIC_KEY, &credentials.public_key)?;
            tracing::info!("Generated new tunnel key pair");
            return Ok(credentials);
        };

        let private = decode_key(&private_b64).ok_or(KeyError::InvalidKey {
            field: "private key",
        })?;
        let derived = BASE64.encode(public_key(&private));

        let stored_public: Option<String> = self.store.load(keys::PUBLIC_KEY);
        if stored_public.as_deref() != Some(derived.as_str()) {
            tracing::warn!("Stored public key missing or mismatched, re-deriving");
            self.store.save(keys::PUBLIC_KEY, &derived)?;
        }

        Ok(TunnelCredentials {
            private_key: private_b64,
            public_key: derived,
        })
    }
}
