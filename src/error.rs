use std::borrow::Cow;

use askama::Template;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

/// Failures of the broker's flows. Each variant maps to exactly one HTTP
/// status; the `Display` text is logged server-side and never rendered.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("request has no `state` parameter")]
    MissingState,

    #[error("failed to decode the OAuth state: {0}")]
    InvalidState(String),

    #[error("failed to unveil the OAuth state: {0}")]
    StateUnveil(String),

    #[error("no active session was found")]
    NoSession,

    #[error("could not authenticate to Kubernetes")]
    K8sAuthRequired,

    #[error(
        "the authenticated identity is not allowed to {verb} {resource} in namespace '{namespace}'"
    )]
    Unauthorized {
        namespace: String,
        resource: String,
        verb: String,
    },

    #[error("unknown service provider '{0}'")]
    UnknownProvider(String),

    #[error("invalid token upload: {0}")]
    InvalidUpload(String),

    #[error("failed to determine if the authenticated user has access: {0}")]
    AuthzCheck(String),

    #[error("not able to generate new random string")]
    Generation,

    #[error("the service provider returned an error: {error} {description}")]
    ProviderDenied { error: String, description: String },

    #[error("failed to finish the OAuth exchange: {0}")]
    ProviderExchange(String),

    #[error("failed to get the SPIAccessToken object {namespace}/{name}: {reason}")]
    TargetLookup {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("failed to persist the token to storage: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingState
            | Self::InvalidState(_)
            | Self::StateUnveil(_)
            | Self::InvalidUpload(_)
            | Self::ProviderDenied { .. } => StatusCode::BAD_REQUEST,
            Self::NoSession | Self::K8sAuthRequired | Self::Unauthorized { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::AuthzCheck(_)
            | Self::Generation
            | Self::ProviderExchange(_)
            | Self::TargetLookup { .. }
            | Self::Storage(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic, non-sensitive message shown to the user agent.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingState => "The request has no `state` parameter.",
            Self::InvalidState(_) => "Failed to decode the OAuth state.",
            Self::StateUnveil(_) => {
                "The OAuth flow could not be matched to this session. Please start the flow again."
            }
            Self::NoSession => {
                "No active session was found. Please use `/login` method to authorize your request and try again. Or provide the token as a `k8s_token` query parameter."
            }
            Self::K8sAuthRequired => "Could not authenticate to Kubernetes.",
            Self::Unauthorized { .. } => "Authenticating the request in Kubernetes unsuccessful.",
            Self::UnknownProvider(_) => "The service provider is not configured.",
            Self::InvalidUpload(_) => "The uploaded token data is invalid.",
            Self::AuthzCheck(_) => "Failed to determine if the authenticated user has access.",
            Self::Generation | Self::Internal(_) => "Internal server error.",
            Self::ProviderDenied { .. } => "The service provider did not grant access.",
            Self::ProviderExchange(_) => "Error in Service Provider token exchange.",
            Self::TargetLookup { .. } | Self::Storage(_) => {
                "Failed to store token data to cluster."
            }
        }
    }

    /// Message rendered on the error page. Only a provider-reported error
    /// carries detail, and that comes from the provider's redirect.
    fn page_message(&self) -> Cow<'static, str> {
        match self {
            Self::ProviderDenied { error, description } if description.is_empty() => {
                Cow::Owned(format!("{} ({error})", self.public_message()))
            }
            Self::ProviderDenied { error, description } => {
                Cow::Owned(format!("{} ({error}: {description})", self.public_message()))
            }
            _ => Cow::Borrowed(self.public_message()),
        }
    }
}

#[derive(Template)]
#[template(path = "callback_error.html")]
pub struct ErrorPage<'a> {
    pub title: &'a str,
    pub message: &'a str,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let title = status.canonical_reason().unwrap_or("Error");
        let message = self.page_message();
        let page = ErrorPage {
            title,
            message: &message,
        };
        match page.render() {
            Ok(body) => (status, Html(body)).into_response(),
            Err(e) => {
                tracing::error!("failed to render error page: {e}");
                (status, self.public_message()).into_response()
            }
        }
    }
}
