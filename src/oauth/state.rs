//! OAuth flow state: the signed payload describing which `SPIAccessToken`
//! a flow is for, and the codec that signs and verifies it.
//!
//! Wire format:  base64url( json ) "." base64url( HMAC-SHA256(json) )
//!
//! The JSON carries an `exp` (unix seconds) next to the claims. Decoding fails
//! closed on a malformed token, a bad signature or an expired payload.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::BrokerError;
use crate::oauth::provider::ProviderType;
use crate::oauth::Token;

type HmacSha256 = Hmac<Sha256>;

/// State minted by the operator for a `SPIAccessToken` before any session
/// exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousState {
    pub token_name: String,
    pub token_namespace: String,
    pub service_provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_provider_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub issued_at: i64,
}

/// State recovered at callback time from the veiled state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeState {
    #[serde(flatten)]
    pub anonymous: AnonymousState,
}

#[derive(Debug)]
pub enum FlowResult {
    Authenticated { token: Token, caller_identity: String },
    K8sAuthRequired,
}

/// Outcome of the provider round trip, with everything needed to store the
/// token.
#[derive(Debug)]
pub struct ExchangeResult {
    pub state: ExchangeState,
    pub result: FlowResult,
}

#[derive(Serialize)]
struct SealedClaims<'a, T> {
    exp: u64,
    #[serde(flatten)]
    claims: &'a T,
}

#[derive(Deserialize)]
struct OpenedClaims<T> {
    exp: u64,
    #[serde(flatten)]
    claims: T,
}

pub struct StateCodec {
    key: Vec<u8>,
    ttl: Duration,
}

impl StateCodec {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: secret.to_vec(),
            ttl,
        }
    }

    fn mac(&self) -> Result<HmacSha256, BrokerError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| BrokerError::Internal(format!("failed to instantiate state codec: {e}")))
    }

    pub fn encode<T: Serialize>(&self, claims: &T) -> Result<String, BrokerError> {
        let exp = unix_now()?.saturating_add(self.ttl.as_secs());
        let json = serde_json::to_vec(&SealedClaims { exp, claims })
            .map_err(|e| BrokerError::Internal(format!("failed to serialize state: {e}")))?;

        let mut mac = self.mac()?;
        mac.update(&json);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verify and parse a state string into any claims type.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, BrokerError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| BrokerError::InvalidState("malformed state".to_string()))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| BrokerError::InvalidState("invalid state encoding".to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BrokerError::InvalidState("invalid signature encoding".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(&json);
        mac.verify_slice(&signature)
            .map_err(|_| BrokerError::InvalidState("state is invalid or tampered".to_string()))?;

        let opened: OpenedClaims<T> = serde_json::from_slice(&json)
            .map_err(|e| BrokerError::InvalidState(format!("state payload corrupt: {e}")))?;

        if unix_now()? > opened.exp {
            return Err(BrokerError::InvalidState("state expired".to_string()));
        }

        Ok(opened.claims)
    }

    pub fn parse_anonymous(&self, token: &str) -> Result<AnonymousState, BrokerError> {
        self.decode(token)
    }
}

pub(crate) fn unix_now() -> Result<u64, BrokerError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| BrokerError::Internal(format!("system time error: {e}")))
}
