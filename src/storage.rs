//! Token storage.
//!
//! The default backend keeps tokens in memory, each record sealed with
//! AES-256-GCM so token material never sits in plaintext in the map.
//!
//! Record format:  nonce (12 bytes) || ciphertext+tag   of the JSON token.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::kube::TargetObjectRef;
use crate::oauth::Token;

#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn store(&self, target: &TargetObjectRef, token: &Token) -> Result<(), BrokerError>;
}

/// Derive a 256-bit AES key from the storage secret using SHA-256.
fn derive_key(secret: &[u8]) -> [u8; 32] {
    Sha256::digest(secret).into()
}

pub struct EncryptedMemoryStorage {
    cipher: Aes256Gcm,
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl EncryptedMemoryStorage {
    pub fn new(secret: &[u8]) -> Result<Self, String> {
        let key = derive_key(secret);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| format!("failed to create cipher: {e}"))?;
        Ok(Self {
            cipher,
            records: RwLock::new(HashMap::new()),
        })
    }

    fn key_of(target: &TargetObjectRef) -> String {
        format!("{}/{}", target.namespace, target.name)
    }

    fn seal(&self, token: &Token) -> Result<Vec<u8>, BrokerError> {
        let plaintext = serde_json::to_vec(token)
            .map_err(|e| BrokerError::Storage(format!("failed to serialize token: {e}")))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| BrokerError::Storage(format!("encryption failed: {e}")))?;

        let mut record = Vec::with_capacity(12 + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    #[cfg(test)]
    fn open(&self, record: &[u8]) -> Result<Token, BrokerError> {
        if record.len() < 13 {
            return Err(BrokerError::Storage("token record too short".to_string()));
        }
        let (nonce, ciphertext) = record.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BrokerError::Storage("token record is invalid or tampered".to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|_| BrokerError::Storage("token record corrupt".to_string()))
    }

    #[cfg(test)]
    async fn get(&self, target: &TargetObjectRef) -> Result<Option<Token>, BrokerError> {
        let records = self.records.read().await;
        records
            .get(&Self::key_of(target))
            .map(|record| self.open(record))
            .transpose()
    }
}

#[async_trait]
impl TokenStorage for EncryptedMemoryStorage {
    async fn store(&self, target: &TargetObjectRef, token: &Token) -> Result<(), BrokerError> {
        let record = self.seal(token)?;
        self.records
            .write()
            .await
            .insert(Self::key_of(target), record);
        tracing::debug!(
            namespace = %target.namespace,
            name = %target.name,
            "token data stored"
        );
        Ok(())
    }
}
