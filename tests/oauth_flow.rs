//! End-to-end flows through the HTTP router with a stub provider token
//! endpoint and in-memory cluster and storage doubles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use tower::ServiceExt;

use spi_oauth_broker::app::{self, AppState};
use spi_oauth_broker::auth::{AccessGate, SessionIdentityExtractor};
use spi_oauth_broker::config::ProviderConfig;
use spi_oauth_broker::error::BrokerError;
use spi_oauth_broker::kube::{ClusterApi, ResourceAttributes, TargetObjectRef};
use spi_oauth_broker::oauth::{
    AnonymousState, ExchangeCoordinator, OAuthClientFactory, ProviderType, StateCodec, StateVeil,
    Token,
};
use spi_oauth_broker::session::{MemorySessionStore, SessionId, SessionStore};
use spi_oauth_broker::storage::TokenStorage;

const ALLOWED: &str = "alice-token";
const DENIED: &str = "mallory-token";
/// Identity whose access review fails with an API error.
const UNREVIEWABLE: &str = "flaky-token";
/// SPIAccessToken name the cluster double cannot find.
const MISSING_TOKEN: &str = "gone";

#[derive(Default)]
struct FakeCluster {
    reviews: Mutex<Vec<(String, ResourceAttributes)>>,
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn self_subject_access_review(
        &self,
        bearer: &str,
        attributes: &ResourceAttributes,
    ) -> Result<bool, BrokerError> {
        self.reviews
            .lock()
            .unwrap()
            .push((bearer.to_string(), attributes.clone()));
        if bearer == UNREVIEWABLE {
            return Err(BrokerError::AuthzCheck("connection refused".to_string()));
        }
        Ok(bearer == ALLOWED)
    }

    async fn get_access_token(
        &self,
        _bearer: &str,
        namespace: &str,
        name: &str,
    ) -> Result<TargetObjectRef, BrokerError> {
        if name == MISSING_TOKEN {
            return Err(BrokerError::TargetLookup {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: "spiaccesstokens.appstudio.redhat.com \"gone\" not found".to_string(),
            });
        }
        Ok(TargetObjectRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("{namespace}-{name}-uid"),
        })
    }
}

#[derive(Default)]
struct RecordingStorage {
    stored: Mutex<Vec<(TargetObjectRef, Token)>>,
    unavailable: AtomicBool,
}

#[async_trait]
impl TokenStorage for RecordingStorage {
    async fn store(&self, target: &TargetObjectRef, token: &Token) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Storage(format!(
                "backend unavailable, dropping {}",
                token.access_token
            )));
        }
        self.stored
            .lock()
            .unwrap()
            .push((target.clone(), token.clone()));
        Ok(())
    }
}

struct TestBroker {
    router: Router,
    codec: Arc<StateCodec>,
    veil: StateVeil,
    cluster: Arc<FakeCluster>,
    storage: Arc<RecordingStorage>,
    token_requests: Arc<AtomicUsize>,
}

async fn stub_provider() -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    let app = Router::new().route(
        "/login/oauth/access_token",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "access_token": "gho_stub_access",
                    "token_type": "bearer",
                    "refresh_token": "ghr_stub_refresh",
                    "expires_in": 28800
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), requests)
}

async fn broker() -> TestBroker {
    let (provider_url, token_requests) = stub_provider().await;

    let sessions: Arc<dyn SessionStore> =
        Arc::new(MemorySessionStore::new(Duration::from_secs(600)));
    let codec = Arc::new(StateCodec::new(&[0x42; 32], Duration::from_secs(300)));
    let veil = StateVeil::new(sessions.clone());
    let cluster = Arc::new(FakeCluster::default());
    let storage = Arc::new(RecordingStorage::default());

    let clients = OAuthClientFactory::new(
        "https://spi.example.com",
        &[ProviderConfig {
            provider_type: ProviderType::GitHub,
            client_id: "spi-client".to_string(),
            client_secret: "spi-client-secret".to_string(),
            base_url: Some(provider_url),
            auth_url: None,
            token_url: None,
        }],
    );

    let coordinator = ExchangeCoordinator {
        codec: codec.clone(),
        veil: veil.clone(),
        gate: AccessGate::new(cluster.clone()),
        identity: Arc::new(SessionIdentityExtractor::new(sessions.clone())),
        clients: Arc::new(clients),
        cluster: cluster.clone(),
        storage: storage.clone(),
        http: reqwest::Client::new(),
        base_url: "https://spi.example.com".to_string(),
    };

    let state = AppState {
        coordinator: Arc::new(coordinator),
        sessions,
        secure_cookies: true,
    };

    TestBroker {
        router: app::router(state, &["https://console.example.com".to_string()]),
        codec,
        veil,
        cluster,
        storage,
        token_requests,
    }
}

fn anonymous_state() -> AnonymousState {
    AnonymousState {
        token_name: "tok1".to_string(),
        token_namespace: "ns1".to_string(),
        service_provider_type: ProviderType::GitHub,
        service_provider_url: Some("https://github.com".to_string()),
        scopes: vec!["repo".to_string()],
        issued_at: 1_700_000_000,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str, bearer: Option<&str>, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, format!("spi_session={session}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn session_cookie(response: &Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| v.strip_prefix("spi_session="))
        .and_then(|v| v.split(';').next())
        .unwrap()
        .to_string()
}

/// Pulls the provider URL out of the redirect notice's link.
fn redirect_target(page: &str) -> url::Url {
    let start = page.find("href=\"").unwrap() + "href=\"".len();
    let end = start + page[start..].find('"').unwrap();
    let unescaped = page[start..end]
        .replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&#x26;", "&")
        .replace("&#x2f;", "/")
        .replace("&#47;", "/");
    url::Url::parse(&unescaped).unwrap()
}

fn query_param(url: &url::Url, name: &str) -> String {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

/// Runs `/authenticate` and returns (session id, veiled state).
async fn start_flow(broker: &TestBroker) -> (String, String) {
    start_flow_for(broker, &anonymous_state()).await
}

async fn start_flow_for(broker: &TestBroker, anonymous: &AnonymousState) -> (String, String) {
    let state = broker.codec.encode(anonymous).unwrap();
    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            Some(ALLOWED),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let session = session_cookie(&response);
    let target = redirect_target(&body_string(response).await);
    (session, query_param(&target, "state"))
}

#[tokio::test]
async fn authenticate_renders_redirect_with_veiled_state() {
    let broker = broker().await;
    let state = broker.codec.encode(&anonymous_state()).unwrap();

    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            Some(ALLOWED),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = session_cookie(&response);

    let target = redirect_target(&body_string(response).await);
    assert_eq!(target.path(), "/login/oauth/authorize");
    assert_eq!(query_param(&target, "client_id"), "spi-client");
    assert_eq!(query_param(&target, "scope"), "repo");
    assert_eq!(
        query_param(&target, "redirect_uri"),
        "https://spi.example.com/github/callback"
    );

    let veiled = query_param(&target, "state");
    assert_eq!(veiled.len(), 32);
    assert_ne!(veiled, state);

    let unveiled = broker
        .veil
        .unveil(&SessionId::new(session), &veiled)
        .await
        .unwrap();
    assert_eq!(
        broker.codec.parse_anonymous(&unveiled).unwrap(),
        anonymous_state()
    );

    let reviews = broker.cluster.reviews.lock().unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].0, ALLOWED);
    assert_eq!(reviews[0].1.namespace, "ns1");
}

#[tokio::test]
async fn authenticate_without_identity_is_401() {
    let broker = broker().await;
    let state = broker.codec.encode(&anonymous_state()).unwrap();

    let response = send(
        &broker.router,
        get(&format!("/github/authenticate?state={state}"), None, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(body_string(response).await.contains("login"));
}

#[tokio::test]
async fn authenticate_with_forged_state_is_400() {
    let broker = broker().await;
    let response = send(
        &broker.router,
        get("/github/authenticate?state=forged.state", Some(ALLOWED), None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authenticate_denied_by_rbac_is_401() {
    let broker = broker().await;
    let state = broker.codec.encode(&anonymous_state()).unwrap();
    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            Some(DENIED),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unconfigured_provider_is_404() {
    let broker = broker().await;
    let state = broker.codec.encode(&anonymous_state()).unwrap();
    let response = send(
        &broker.router,
        get(&format!("/quay/authenticate?state={state}"), Some(ALLOWED), None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_stores_token_and_redirects() {
    let broker = broker().await;
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://spi.example.com/callback_success"
    );
    assert!(!body_string(response).await.contains("gho_stub_access"));

    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 1);
    let stored = broker.storage.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    let (target, token) = &stored[0];
    assert_eq!(target.namespace, "ns1");
    assert_eq!(target.name, "tok1");
    assert_eq!(token.access_token, "gho_stub_access");
    assert_eq!(token.refresh_token, "ghr_stub_refresh");
}

#[tokio::test]
async fn callback_with_unauthorized_identity_is_401() {
    let broker = broker().await;
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(DENIED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 0);
    assert!(broker.storage.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callback_with_forged_state_never_reaches_provider() {
    let broker = broker().await;
    let (session, _) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            "/github/callback?state=0123456789abcdefghijklmnopqrstuv&code=c0de",
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callback_without_session_cookie_fails() {
    let broker = broker().await;
    let (_, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(ALLOWED),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callback_with_provider_error_shows_it() {
    let broker = broker().await;
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!(
                "/github/callback?state={veiled}&error=access_denied&error_description=user%20declined"
            ),
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(body.contains("access_denied"));
    assert!(body.contains("user declined"));
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callback_when_access_review_fails_never_reaches_provider() {
    let broker = broker().await;
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(UNREVIEWABLE),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_string(response).await.contains("connection refused"));
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 0);
    assert!(broker.storage.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callback_with_missing_target_is_500_without_token() {
    let broker = broker().await;
    let mut anonymous = anonymous_state();
    anonymous.token_name = MISSING_TOKEN.to_string();
    let (session, veiled) = start_flow_for(&broker, &anonymous).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(!body.contains("gho_stub_access"));
    assert!(!body.contains("not found"));
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 1);
    assert!(broker.storage.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callback_with_failing_storage_is_500_without_token() {
    let broker = broker().await;
    broker.storage.unavailable.store(true, Ordering::SeqCst);
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("Failed to store token data to cluster."));
    assert!(!body.contains("gho_stub_access"));
    assert_eq!(broker.token_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_with_unissued_session_cookie_gets_new_session() {
    let broker = broker().await;
    let chosen = "attacker-chosen-session-id";

    let response = send(
        &broker.router,
        Request::post("/login")
            .header(header::AUTHORIZATION, format!("Bearer {ALLOWED}"))
            .header(header::COOKIE, format!("spi_session={chosen}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_ne!(session_cookie(&response), chosen);

    // The chosen ID carries no identity.
    let state = broker.codec.encode(&anonymous_state()).unwrap();
    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            None,
            Some(chosen),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(broker.cluster.reviews.lock().unwrap().is_empty());
}

#[tokio::test]
async fn authenticate_with_unissued_session_cookie_gets_new_session() {
    let broker = broker().await;
    let state = broker.codec.encode(&anonymous_state()).unwrap();

    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            Some(ALLOWED),
            Some("attacker-chosen-session-id"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_ne!(session_cookie(&response), "attacker-chosen-session-id");
}

#[tokio::test]
async fn login_renews_live_session_and_keeps_pending_flow() {
    let broker = broker().await;
    let (session, veiled) = start_flow(&broker).await;

    let response = send(
        &broker.router,
        Request::post("/login")
            .header(header::AUTHORIZATION, format!("Bearer {ALLOWED}"))
            .header(header::COOKIE, format!("spi_session={session}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let renewed = session_cookie(&response);
    assert_ne!(renewed, session);

    // The old ID no longer finds the pending flow.
    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            Some(ALLOWED),
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The renewed one finds it and carries the identity.
    let response = send(
        &broker.router,
        get(
            &format!("/github/callback?state={veiled}&code=c0de"),
            None,
            Some(&renewed),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(broker.storage.stored.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn login_then_authenticate_with_session_only() {
    let broker = broker().await;

    let response = send(
        &broker.router,
        Request::post("/login")
            .header(header::AUTHORIZATION, format!("Bearer {ALLOWED}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let session = session_cookie(&response);

    let state = broker.codec.encode(&anonymous_state()).unwrap();
    let response = send(
        &broker.router,
        get(
            &format!("/github/authenticate?state={state}"),
            None,
            Some(&session),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broker.cluster.reviews.lock().unwrap()[0].0, ALLOWED);
}

#[tokio::test]
async fn token_upload_stores_token() {
    let broker = broker().await;
    let body = serde_json::json!({
        "access_token": "uploaded",
        "token_type": "bearer"
    });

    let response = send(
        &broker.router,
        Request::post("/token/ns1/tok1")
            .header(header::AUTHORIZATION, format!("Bearer {ALLOWED}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let stored = broker.storage.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0.name, "tok1");
    assert_eq!(stored[0].1.access_token, "uploaded");
}

#[tokio::test]
async fn token_upload_rejects_empty_access_token() {
    let broker = broker().await;
    let response = send(
        &broker.router,
        Request::post("/token/ns1/tok1")
            .header(header::AUTHORIZATION, format!("Bearer {ALLOWED}"))
            .body(Body::from(r#"{"access_token": ""}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(broker.storage.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn token_upload_requires_access() {
    let broker = broker().await;
    let response = send(
        &broker.router,
        Request::post("/token/ns1/tok1")
            .header(header::AUTHORIZATION, format!("Bearer {DENIED}"))
            .body(Body::from(r#"{"access_token": "x"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(broker.storage.stored.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callback_error_page_escapes_query() {
    let broker = broker().await;
    let response = send(
        &broker.router,
        get(
            "/callback_error?error=access_denied&error_description=%3Cscript%3Ealert(1)%3C%2Fscript%3E",
            None,
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("access_denied"));
    assert!(!body.contains("<script>"));
}

#[tokio::test]
async fn probes_and_success_page() {
    let broker = broker().await;
    for uri in ["/health", "/ready", "/callback_success"] {
        let response = send(&broker.router, get(uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}
