use std::collections::HashMap;

use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum_extra::extract::cookie::CookieJar;

use crate::app::AppState;
use crate::auth::CallerRequest;
use crate::error::BrokerError;
use crate::oauth::ProviderType;
use crate::session::SessionId;

#[derive(Template)]
#[template(path = "redirect_notice.html")]
struct RedirectNotice<'a> {
    url: &'a str,
}

fn configured_provider(state: &AppState, segment: &str) -> Result<ProviderType, BrokerError> {
    ProviderType::from_path_segment(segment)
        .filter(|p| state.coordinator.clients.is_configured(*p))
        .ok_or_else(|| BrokerError::UnknownProvider(segment.to_string()))
}

/// GET /{provider}/authenticate: start the OAuth flow with a signed state
pub async fn authenticate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, BrokerError> {
    let provider = configured_provider(&state, &provider)?;
    let (session, jar) =
        SessionId::resolve(jar, state.sessions.as_ref(), state.secure_cookies).await?;
    let request = CallerRequest {
        headers,
        query,
        session: Some(session),
    };

    let url = state.coordinator.authenticate(provider, &request).await?;
    let page = RedirectNotice { url: &url }.render().map_err(|e| {
        BrokerError::Internal(format!("failed to return redirect notice HTML page: {e}"))
    })?;
    Ok((jar, Html(page)))
}

/// GET /{provider}/callback: provider redirect back with the veiled state
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, BrokerError> {
    let provider = configured_provider(&state, &provider)?;
    let request = CallerRequest {
        headers,
        query,
        session: SessionId::from_jar(&jar),
    };

    let location = state.coordinator.callback(provider, &request).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]))
}

/// POST /login: remember the caller's Kubernetes token in the session.
/// The session always gets a new ID before the token is recorded.
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, BrokerError> {
    let request = CallerRequest {
        headers,
        query,
        session: None,
    };
    let identity = &state.coordinator.identity;
    let token = identity.get_token(&request).await?;

    let (session, jar) =
        SessionId::renew(jar, state.sessions.as_ref(), state.secure_cookies).await?;
    identity.login(&session, &token).await?;
    tracing::debug!("session login");
    Ok((jar, StatusCode::NO_CONTENT))
}
