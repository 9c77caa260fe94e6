use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use crate::error::BrokerError;
use crate::session::{SessionId, SessionStore};

pub const TOKEN_QUERY_PARAM: &str = "k8s_token";

const SESSION_TOKEN_KEY: &str = "k8s_token";

/// The parts of an inbound request the broker's flows look at.
#[derive(Debug, Clone)]
pub struct CallerRequest {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    /// Absent when the request carries no session cookie.
    pub session: Option<SessionId>,
}

impl CallerRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Resolves the caller's Kubernetes bearer token.
#[async_trait]
pub trait IdentityExtractor: Send + Sync {
    /// [`BrokerError::NoSession`] when the request carries no identity.
    async fn get_token(&self, request: &CallerRequest) -> Result<String, BrokerError>;

    /// Remember `token` for later requests of the same session.
    async fn login(&self, session: &SessionId, token: &str) -> Result<(), BrokerError>;
}

/// Looks for the token in the `Authorization` header, then the `k8s_token`
/// query parameter, then the session.
pub struct SessionIdentityExtractor {
    sessions: Arc<dyn SessionStore>,
}

impl SessionIdentityExtractor {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl IdentityExtractor for SessionIdentityExtractor {
    async fn get_token(&self, request: &CallerRequest) -> Result<String, BrokerError> {
        if let Some(token) = bearer_from_headers(&request.headers) {
            return Ok(token.to_string());
        }
        if let Some(token) = request.param(TOKEN_QUERY_PARAM) {
            return Ok(token.to_string());
        }
        let Some(session) = &request.session else {
            return Err(BrokerError::NoSession);
        };
        self.sessions
            .get(session, SESSION_TOKEN_KEY)
            .await?
            .filter(|t| !t.is_empty())
            .ok_or(BrokerError::NoSession)
    }

    async fn login(&self, session: &SessionId, token: &str) -> Result<(), BrokerError> {
        if token.is_empty() {
            return Err(BrokerError::NoSession);
        }
        self.sessions
            .put(session, SESSION_TOKEN_KEY, token.to_string())
            .await
    }
}
