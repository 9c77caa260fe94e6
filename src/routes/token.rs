use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum_extra::extract::cookie::CookieJar;

use crate::app::AppState;
use crate::auth::CallerRequest;
use crate::error::BrokerError;
use crate::oauth::Token;
use crate::session::SessionId;

/// POST /token/{namespace}/{name}: store token data supplied directly by the
/// caller instead of obtained through an OAuth flow
pub async fn upload(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> Result<StatusCode, BrokerError> {
    let coordinator = &state.coordinator;
    let request = CallerRequest {
        headers,
        query,
        session: SessionId::from_jar(&jar),
    };
    let bearer = coordinator.identity.get_token(&request).await?;

    let token: Token = serde_json::from_slice(&body).map_err(|e| {
        BrokerError::InvalidUpload(format!("failed to decode request body as token JSON: {e}"))
    })?;
    if token.access_token.is_empty() {
        return Err(BrokerError::InvalidUpload(
            "access token can't be omitted or empty".to_string(),
        ));
    }

    coordinator.gate.require_token_update(&bearer, &namespace).await?;
    let target = coordinator
        .cluster
        .get_access_token(&bearer, &namespace, &name)
        .await?;
    coordinator.storage.store(&target, &token).await?;

    tracing::info!(
        target: "audit",
        namespace = %namespace,
        name = %name,
        "token data uploaded"
    );
    Ok(StatusCode::NO_CONTENT)
}
