//! Veiling of the OAuth `state` parameter.
//!
//! The state sent to the service provider is an opaque random token. The real,
//! self-describing state stays in the caller's session and is looked up again
//! when the provider redirects back.

use std::sync::Arc;

use crate::error::BrokerError;
use crate::oauth::random;
use crate::session::{SessionId, SessionStore};

pub const VEILED_STATE_LENGTH: usize = 32;

const MAX_VEIL_ATTEMPTS: usize = 4;

#[derive(Clone)]
pub struct StateVeil {
    store: Arc<dyn SessionStore>,
}

impl StateVeil {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Record `real_state` under a fresh veiled token and return the token.
    pub async fn veil(&self, session: &SessionId, real_state: &str) -> Result<String, BrokerError> {
        if real_state.is_empty() {
            tracing::error!("Request has no state parameter");
            return Err(BrokerError::MissingState);
        }

        for _ in 0..MAX_VEIL_ATTEMPTS {
            let veiled = random::generate(VEILED_STATE_LENGTH)?;
            if self.store.get(session, &veiled).await?.is_some() {
                continue;
            }
            self.store
                .put(session, &veiled, real_state.to_string())
                .await?;
            tracing::debug!(veil = %veiled, "State veiled");
            return Ok(veiled);
        }

        Err(BrokerError::Generation)
    }

    /// Look up the real state behind `query_state`.
    ///
    /// An unknown or expired token yields an empty string, not an error. The
    /// entry is not removed, so it stays readable until the session expires.
    pub async fn unveil(
        &self,
        session: &SessionId,
        query_state: &str,
    ) -> Result<String, BrokerError> {
        if query_state.is_empty() {
            tracing::error!("Request has no state parameter");
            return Err(BrokerError::MissingState);
        }

        let unveiled = self
            .store
            .get(session, query_state)
            .await?
            .unwrap_or_default();
        tracing::debug!(veil = %query_state, found = !unveiled.is_empty(), "State unveiled");
        Ok(unveiled)
    }
}
