//! Wiring: builds the shared application state from configuration and the
//! axum router serving it.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{AccessGate, SessionIdentityExtractor};
use crate::config::Config;
use crate::kube::KubeClient;
use crate::oauth::{ExchangeCoordinator, OAuthClientFactory, StateCodec, StateVeil};
use crate::routes;
use crate::session::{MemorySessionStore, SessionStore};
use crate::storage::EncryptedMemoryStorage;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExchangeCoordinator>,
    pub sessions: Arc<dyn SessionStore>,
    pub secure_cookies: bool,
}

impl AppState {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let timeout = Duration::from_secs(cfg.server.request_timeout);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;

        let mut kube_http = reqwest::Client::builder().timeout(timeout);
        if let Some(path) = &cfg.kubernetes.ca_cert_path {
            let pem = std::fs::read(path)
                .map_err(|e| format!("Failed to read kubernetes.ca_cert_path '{path}': {e}"))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                format!("kubernetes.ca_cert_path '{path}' is not a PEM certificate: {e}")
            })?;
            kube_http = kube_http.add_root_certificate(cert);
        }
        let kube_http = kube_http
            .build()
            .map_err(|e| format!("failed to build Kubernetes client: {e}"))?;
        let cluster = Arc::new(KubeClient::new(&cfg.kubernetes.api_server, kube_http));

        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(
            Duration::from_secs(cfg.server.session_ttl),
        ));
        let storage = Arc::new(EncryptedMemoryStorage::new(
            &cfg.server.storage_secret_bytes()?,
        )?);

        let coordinator = ExchangeCoordinator {
            codec: Arc::new(StateCodec::new(
                &cfg.server.state_secret_bytes()?,
                Duration::from_secs(cfg.server.state_ttl),
            )),
            veil: StateVeil::new(sessions.clone()),
            gate: AccessGate::new(cluster.clone()),
            identity: Arc::new(SessionIdentityExtractor::new(sessions.clone())),
            clients: Arc::new(OAuthClientFactory::new(&cfg.server.base_url, &cfg.providers)),
            cluster,
            storage,
            http,
            base_url: cfg.server.base_url.clone(),
        };

        Ok(Self {
            coordinator: Arc::new(coordinator),
            sessions,
            secure_cookies: cfg.server.secure_cookies(),
        })
    }
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, "ignoring invalid allowed origin: {e}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::ACCEPT,
            header::ACCEPT_LANGUAGE,
            header::CONTENT_LANGUAGE,
            header::ORIGIN,
            header::AUTHORIZATION,
        ])
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        // OAuth flow
        .route("/{provider}/authenticate", get(routes::authorize::authenticate))
        .route("/{provider}/callback", get(routes::authorize::callback))
        .route("/login", post(routes::authorize::login))
        // Token upload
        .route("/token/{namespace}/{name}", post(routes::token::upload))
        // Landing pages and probes
        .route("/callback_success", get(routes::pages::callback_success))
        .route("/callback_error", get(routes::pages::callback_error))
        .route("/health", get(routes::pages::ok))
        .route("/ready", get(routes::pages::ok))
        .layer(cors(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
