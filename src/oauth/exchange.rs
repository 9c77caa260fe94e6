//! The two-phase OAuth exchange.
//!
//! `authenticate` turns a signed anonymous state into a provider redirect:
//! decode state → identify caller → access check → veil state → build URL.
//!
//! `callback` completes it: unveil state → decode → identify caller and check
//! access again → exchange the code → look up the target object → store.
//! The access check runs on every call with the identity presented at that
//! call.

use std::sync::Arc;

use crate::auth::access::TOKEN_DATA_UPDATES;
use crate::auth::{AccessGate, CallerRequest, IdentityExtractor};
use crate::error::BrokerError;
use crate::kube::ClusterApi;
use crate::oauth::provider::{OAuthClientFactory, ProviderType};
use crate::oauth::state::{AnonymousState, ExchangeResult, ExchangeState, FlowResult, StateCodec};
use crate::oauth::veil::StateVeil;
use crate::oauth::Token;
use crate::storage::TokenStorage;

pub struct ExchangeCoordinator {
    pub codec: Arc<StateCodec>,
    pub veil: StateVeil,
    pub gate: AccessGate,
    pub identity: Arc<dyn IdentityExtractor>,
    pub clients: Arc<OAuthClientFactory>,
    pub cluster: Arc<dyn ClusterApi>,
    pub storage: Arc<dyn TokenStorage>,
    pub http: reqwest::Client,
    pub base_url: String,
}

fn ensure_provider(state: &AnonymousState, provider: ProviderType) -> Result<(), BrokerError> {
    if state.service_provider_type == provider {
        Ok(())
    } else {
        Err(BrokerError::InvalidState(format!(
            "state is for {} but the flow runs against {provider}",
            state.service_provider_type
        )))
    }
}

impl ExchangeCoordinator {
    /// Returns the provider authorization URL for the caller's user agent.
    #[tracing::instrument(name = "authenticate", skip_all, fields(provider = %provider))]
    pub async fn authenticate(
        &self,
        provider: ProviderType,
        request: &CallerRequest,
    ) -> Result<String, BrokerError> {
        let state_string = request.param("state").ok_or(BrokerError::MissingState)?;
        let state = self.codec.parse_anonymous(state_string)?;
        ensure_provider(&state, provider)?;

        let bearer = self.identity.get_token(request).await?;
        self.gate
            .require_token_update(&bearer, &state.token_namespace)
            .await?;

        tracing::info!(
            target: "audit",
            namespace = %state.token_namespace,
            name = %state.token_name,
            provider = %state.service_provider_type,
            scopes = ?state.scopes,
            "OAuth authentication flow started"
        );

        let session = request
            .session
            .as_ref()
            .ok_or_else(|| {
                BrokerError::Internal("no session to record the OAuth state in".to_string())
            })?;
        let veiled = self.veil.veil(session, state_string).await?;
        let client = self.clients.build(provider, &state.scopes)?;
        let url = client.auth_code_url(&veiled);
        tracing::debug!(url = %url, "Redirecting");
        Ok(url)
    }

    /// Completes the flow and returns where to send the user agent.
    #[tracing::instrument(name = "callback", skip_all, fields(provider = %provider))]
    pub async fn callback(
        &self,
        provider: ProviderType,
        request: &CallerRequest,
    ) -> Result<String, BrokerError> {
        let exchange = self.finish_exchange(provider, request).await?;

        let (token, caller_identity) = match exchange.result {
            FlowResult::Authenticated {
                token,
                caller_identity,
            } => (token, caller_identity),
            FlowResult::K8sAuthRequired => return Err(BrokerError::K8sAuthRequired),
        };

        self.sync_token_data(&exchange.state, &token, &caller_identity)
            .await?;

        let anonymous = &exchange.state.anonymous;
        tracing::info!(
            target: "audit",
            namespace = %anonymous.token_namespace,
            name = %anonymous.token_name,
            provider = %anonymous.service_provider_type,
            scopes = ?anonymous.scopes,
            "OAuth authentication completed successfully"
        );

        Ok(request
            .param("redirect_after_login")
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{}/callback_success", self.base_url.trim_end_matches('/'))
            }))
    }

    async fn finish_exchange(
        &self,
        provider: ProviderType,
        request: &CallerRequest,
    ) -> Result<ExchangeResult, BrokerError> {
        let session = request
            .session
            .as_ref()
            .ok_or_else(|| BrokerError::StateUnveil("request carries no session".to_string()))?;
        let query_state = request.param("state").unwrap_or_default();
        let unveiled = self
            .veil
            .unveil(session, query_state)
            .await
            .map_err(|e| BrokerError::StateUnveil(e.to_string()))?;
        if unveiled.is_empty() {
            return Err(BrokerError::StateUnveil(
                "no pending OAuth flow for this state in the session".to_string(),
            ));
        }

        let state: ExchangeState = self.codec.decode(&unveiled)?;
        ensure_provider(&state.anonymous, provider)?;

        let bearer = match self.identity.get_token(request).await {
            Ok(bearer) => bearer,
            Err(BrokerError::NoSession) => {
                return Ok(ExchangeResult {
                    state,
                    result: FlowResult::K8sAuthRequired,
                })
            }
            Err(e) => return Err(e),
        };
        let allowed = self
            .gate
            .check_access(
                &bearer,
                &state.anonymous.token_namespace,
                TOKEN_DATA_UPDATES,
                "create",
            )
            .await?;
        if !allowed {
            return Ok(ExchangeResult {
                state,
                result: FlowResult::K8sAuthRequired,
            });
        }

        if let Some(error) = request.param("error") {
            return Err(BrokerError::ProviderDenied {
                error: error.to_string(),
                description: request
                    .param("error_description")
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        let code = request.param("code").ok_or_else(|| {
            BrokerError::ProviderExchange("no authorization code in callback".to_string())
        })?;

        let client = self.clients.build(provider, &state.anonymous.scopes)?;
        let token = client
            .exchange(&self.http, code, request.param("scope"))
            .await?;

        Ok(ExchangeResult {
            state,
            result: FlowResult::Authenticated {
                token,
                caller_identity: bearer,
            },
        })
    }

    /// Stores the token for the target `SPIAccessToken`, looked up with the
    /// caller's identity.
    async fn sync_token_data(
        &self,
        state: &ExchangeState,
        token: &Token,
        caller_identity: &str,
    ) -> Result<(), BrokerError> {
        let target = self
            .cluster
            .get_access_token(
                caller_identity,
                &state.anonymous.token_namespace,
                &state.anonymous.token_name,
            )
            .await?;
        self.storage.store(&target, token).await
    }
}
