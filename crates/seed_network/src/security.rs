//! Payload encryption and per-agent authentication tokens.
//!
//! Payloads are sealed with AES-256-GCM under a single process-wide key;
//! the random 96-bit nonce is prepended to the ciphertext. Tokens are 32
//! random bytes per agent identity, handed out as base64 and compared in
//! constant time.

use std::time::Duration;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::error::NetworkError;

const AES_NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TOKEN_LEN: usize = 32;

struct IssuedToken {
    bytes: [u8; TOKEN_LEN],
    issued_at: DateTime<Utc>,
}

/// Confidentiality and authentication for wire payloads.
pub struct NetworkSecurity {
    cipher: Aes256Gcm,
    key_material: [u8; KEY_LEN],
    tokens: DashMap<String, IssuedToken>,
    token_ttl: Option<Duration>,
}

impl NetworkSecurity {
    /// Create a security layer with a freshly generated key.
    pub fn new() -> Self {
        Self::from_key(rand::random())
    }

    /// Create a security layer from an existing 256-bit key.
    pub fn from_key(key_material: [u8; KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key_material);
        Self {
            cipher: Aes256Gcm::new(key),
            key_material,
            tokens: DashMap::new(),
            token_ttl: None,
        }
    }

    /// Create a security layer from a base64-encoded 256-bit key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, NetworkError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| NetworkError::Decryption(format!("Invalid key encoding: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            NetworkError::Decryption(format!("Key must be {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_key(key))
    }

    /// Expire tokens older than `ttl`.
    pub fn with_token_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Base64 form of the key, for distribution to cluster members.
    pub fn export_key(&self) -> String {
        BASE64.encode(self.key_material)
    }

    // -----------------------------------------------------------------------
    // Encryption
    // -----------------------------------------------------------------------

    /// Serialize `payload` to JSON and seal it.
    pub fn encrypt<T: Serialize>(&self, payload: &T) -> Result<Vec<u8>, NetworkError> {
        let plaintext = serde_json::to_vec(payload)?;
        self.encrypt_bytes(&plaintext)
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let nonce_bytes: [u8; AES_NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| NetworkError::Transport(format!("Encryption failed: {e}")))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed payload and decode it. Any failure, including a
    /// plaintext that is not the expected JSON, is a decryption error.
    pub fn decrypt<T: DeserializeOwned>(&self, sealed: &[u8]) -> Result<T, NetworkError> {
        let plaintext = self.decrypt_bytes(sealed)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| NetworkError::Decryption(format!("Malformed plaintext: {e}")))
    }

    pub fn decrypt_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>, NetworkError> {
        if sealed.len() < AES_NONCE_LEN {
            return Err(NetworkError::Decryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| NetworkError::Decryption("Wrong key or tampered payload".to_string()))
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    /// Issue a fresh token for `agent_id`, replacing (and so revoking) any
    /// earlier one. Returns the base64 token for out-of-band distribution.
    pub fn issue_token(&self, agent_id: &str) -> String {
        let bytes: [u8; TOKEN_LEN] = rand::random();
        let replaced = self
            .tokens
            .insert(
                agent_id.to_string(),
                IssuedToken {
                    bytes,
                    issued_at: Utc::now(),
                },
            )
            .is_some();
        if replaced {
            info!("Re-issued token for {agent_id}; previous token revoked");
        } else {
            info!("Issued token for {agent_id}");
        }
        BASE64.encode(bytes)
    }

    /// Check `token` against the token currently issued to `agent_id`.
    /// Never errors: unknown identities, bad encodings, expired and
    /// mismatched tokens all yield `false`.
    pub fn verify_token(&self, agent_id: &str, token: &str) -> bool {
        let Some(stored) = self.tokens.get(agent_id) else {
            return false;
        };

        if let Some(ttl) = self.token_ttl {
            let age = Utc::now().signed_duration_since(stored.issued_at);
            if age.to_std().map(|age| age > ttl).unwrap_or(false) {
                debug!("Token for {agent_id} has expired");
                return false;
            }
        }

        let Ok(provided) = BASE64.decode(token.as_bytes()) else {
            return false;
        };
        if provided.len() != TOKEN_LEN {
            return false;
        }
        stored.bytes.as_slice().ct_eq(provided.as_slice()).into()
    }

    /// Like [`verify_token`](Self::verify_token), but as a typed error for
    /// request paths.
    pub fn authenticate(&self, agent_id: &str, token: Option<&str>) -> Result<(), NetworkError> {
        match token {
            Some(token) if self.verify_token(agent_id, token) => Ok(()),
            Some(_) => Err(NetworkError::Authentication(format!(
                "Invalid token for {agent_id}"
            ))),
            None => Err(NetworkError::Authentication(format!(
                "No token presented by {agent_id}"
            ))),
        }
    }

    /// Revoke the token issued to `agent_id`. Returns whether one existed.
    pub fn revoke_token(&self, agent_id: &str) -> bool {
        self.tokens.remove(agent_id).is_some()
    }

    #[cfg(test)]
    fn backdate_token(&self, agent_id: &str, by: chrono::Duration) {
        if let Some(mut entry) = self.tokens.get_mut(agent_id) {
            entry.issued_at -= by;
        }
    }
}

impl Default for NetworkSecurity {
    fn default() -> Self {
        Self::new()
    }
}
