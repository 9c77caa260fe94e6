//! Service provider capabilities and the OAuth client built from them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::BrokerError;
use crate::oauth::state::unix_now;
use crate::oauth::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    GitHub,
    Quay,
    GitLab,
}

/// What differs between providers. Selected by [`ProviderType`].
#[derive(Debug, Clone, Copy)]
pub struct ProviderCapabilities {
    pub default_base_url: &'static str,
    pub auth_path: &'static str,
    pub token_path: &'static str,
    /// Quay requires the granted `scope` on the code exchange. It is not a
    /// standard token request parameter, so other providers don't get it.
    pub supports_scope_on_exchange: bool,
}

impl ProviderType {
    pub const ALL: [ProviderType; 3] = [Self::GitHub, Self::Quay, Self::GitLab];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "GitHub",
            Self::Quay => "Quay",
            Self::GitLab => "GitLab",
        }
    }

    /// Lowercase name used in route paths.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Quay => "quay",
            Self::GitLab => "gitlab",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.path_segment().eq_ignore_ascii_case(segment))
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            Self::GitHub => ProviderCapabilities {
                default_base_url: "https://github.com",
                auth_path: "/login/oauth/authorize",
                token_path: "/login/oauth/access_token",
                supports_scope_on_exchange: false,
            },
            Self::Quay => ProviderCapabilities {
                default_base_url: "https://quay.io",
                auth_path: "/oauth/authorize",
                token_path: "/oauth/access_token",
                supports_scope_on_exchange: true,
            },
            Self::GitLab => ProviderCapabilities {
                default_base_url: "https://gitlab.com",
                auth_path: "/oauth/authorize",
                token_path: "/oauth/token",
                supports_scope_on_exchange: false,
            },
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub auth_url: String,
    pub token_url: String,
}

impl Endpoint {
    fn resolve(provider: ProviderType, cfg: &ProviderConfig) -> Self {
        let caps = provider.capabilities();
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or(caps.default_base_url)
            .trim_end_matches('/');
        Self {
            auth_url: cfg
                .auth_url
                .clone()
                .unwrap_or_else(|| format!("{base}{}", caps.auth_path)),
            token_url: cfg
                .token_url
                .clone()
                .unwrap_or_else(|| format!("{base}{}", caps.token_path)),
        }
    }
}

/// Callback URL for a provider: `base_url/<lowercase provider>/callback`.
pub fn redirect_url(base_url: &str, provider: ProviderType) -> String {
    format!(
        "{}/{}/callback",
        base_url.trim_end_matches('/'),
        provider.path_segment()
    )
}

/// A fully configured OAuth client for one flow.
#[derive(Clone)]
pub struct OAuthClient {
    pub provider: ProviderType,
    pub client_id: String,
    client_secret: String,
    pub redirect_url: String,
    pub endpoint: Endpoint,
    pub scopes: Vec<String>,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("endpoint", &self.endpoint)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl OAuthClient {
    /// Authorization URL the user agent is sent to.
    pub fn auth_code_url(&self, state: &str) -> String {
        let sep = if self.endpoint.auth_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{sep}client_id={}&redirect_uri={}&response_type=code",
            self.endpoint.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_url),
        );
        if !self.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&self.scopes.join(" ")));
        }
        url.push_str("&state=");
        url.push_str(&urlencoding::encode(state));
        url
    }

    /// Exchange an authorization code at the token endpoint.
    ///
    /// `scope_hint` is only forwarded to providers that require it.
    pub async fn exchange(
        &self,
        http: &reqwest::Client,
        code: &str,
        scope_hint: Option<&str>,
    ) -> Result<Token, BrokerError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if self.provider.capabilities().supports_scope_on_exchange {
            if let Some(scope) = scope_hint {
                params.push(("scope", scope));
            }
        }

        let response = http
            .post(&self.endpoint.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::ProviderExchange(format!("token request failed: {e}")))?;

        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|e| {
            BrokerError::ProviderExchange(format!(
                "unreadable token response (status {status}): {e}"
            ))
        })?;

        if let Some(error) = body.error {
            return Err(BrokerError::ProviderExchange(format!(
                "{error}: {}",
                body.error_description.unwrap_or_default()
            )));
        }
        if !status.is_success() {
            return Err(BrokerError::ProviderExchange(format!(
                "token endpoint returned {status}"
            )));
        }

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                BrokerError::ProviderExchange("token response has no access_token".to_string())
            })?;
        let expiry = match body.expires_in {
            Some(secs) if secs > 0 => unix_now()?.saturating_add(secs),
            _ => 0,
        };

        Ok(Token {
            access_token,
            token_type: body.token_type.unwrap_or_else(|| "bearer".to_string()),
            refresh_token: body.refresh_token.unwrap_or_default(),
            expiry,
        })
    }
}

struct ProviderSettings {
    client_id: String,
    client_secret: String,
    endpoint: Endpoint,
}

/// Builds [`OAuthClient`]s from the static provider configuration.
pub struct OAuthClientFactory {
    base_url: String,
    providers: HashMap<ProviderType, ProviderSettings>,
}

impl OAuthClientFactory {
    pub fn new(base_url: &str, providers: &[ProviderConfig]) -> Self {
        let providers = providers
            .iter()
            .map(|cfg| {
                (
                    cfg.provider_type,
                    ProviderSettings {
                        client_id: cfg.client_id.clone(),
                        client_secret: cfg.client_secret.clone(),
                        endpoint: Endpoint::resolve(cfg.provider_type, cfg),
                    },
                )
            })
            .collect();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            providers,
        }
    }

    pub fn is_configured(&self, provider: ProviderType) -> bool {
        self.providers.contains_key(&provider)
    }

    pub fn build(
        &self,
        provider: ProviderType,
        scopes: &[String],
    ) -> Result<OAuthClient, BrokerError> {
        let settings = self
            .providers
            .get(&provider)
            .ok_or_else(|| BrokerError::UnknownProvider(provider.to_string()))?;
        Ok(OAuthClient {
            provider,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_url: redirect_url(&self.base_url, provider),
            endpoint: settings.endpoint.clone(),
            scopes: scopes.to_vec(),
        })
    }
}
