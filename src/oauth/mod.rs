//! The OAuth side of the broker: state handling, providers and the
//! authenticate/callback exchange.

pub mod exchange;
pub mod provider;
pub mod random;
pub mod state;
pub mod veil;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use exchange::ExchangeCoordinator;
pub use provider::{OAuthClient, OAuthClientFactory, ProviderType};
pub use state::{AnonymousState, ExchangeResult, ExchangeState, FlowResult, StateCodec};
pub use veil::StateVeil;

/// Token data obtained from a service provider. `expiry` is in unix seconds,
/// 0 when the provider did not send one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expiry: u64,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}
