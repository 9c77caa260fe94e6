//! Server-side sessions keyed by an opaque cookie. Only IDs issued here are
//! ever adopted from a cookie.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tokio::sync::Mutex;

use crate::error::BrokerError;
use crate::oauth::random;

pub const SESSION_COOKIE: &str = "spi_session";

const SESSION_ID_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Result<Self, BrokerError> {
        random::generate(SESSION_ID_LENGTH).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_jar(jar: &CookieJar) -> Option<Self> {
        jar.get(SESSION_COOKIE)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    /// Returns the live session named by the jar's cookie. A missing, unknown
    /// or expired session is replaced by a freshly issued one, whose cookie is
    /// added to the returned jar.
    pub async fn resolve(
        jar: CookieJar,
        store: &dyn SessionStore,
        secure: bool,
    ) -> Result<(Self, CookieJar), BrokerError> {
        if let Some(id) = Self::from_jar(&jar) {
            if store.exists(&id).await? {
                return Ok((id, jar));
            }
            tracing::debug!("ignoring cookie for an unknown session");
        }
        Self::issue(jar, secure)
    }

    /// Issues a new session ID and carries the entries of the jar's current
    /// session, if it is live, over to it. The old ID stops working.
    pub async fn renew(
        jar: CookieJar,
        store: &dyn SessionStore,
        secure: bool,
    ) -> Result<(Self, CookieJar), BrokerError> {
        let previous = Self::from_jar(&jar);
        let (id, jar) = Self::issue(jar, secure)?;
        if let Some(previous) = previous {
            store.renew(&previous, &id).await?;
        }
        Ok((id, jar))
    }

    fn issue(jar: CookieJar, secure: bool) -> Result<(Self, CookieJar), BrokerError> {
        let id = Self::generate()?;
        let cookie = Cookie::build((SESSION_COOKIE, id.as_str().to_owned()))
            .path("/")
            .http_only(true)
            .secure(secure)
            // The callback arrives as a top-level navigation from the provider.
            .same_site(SameSite::Lax);
        Ok((id, jar.add(cookie)))
    }
}

/// Key-value storage scoped to a session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: &SessionId, key: &str, value: String) -> Result<(), BrokerError>;

    /// Returns `None` when the session or the key is absent or expired.
    async fn get(&self, session: &SessionId, key: &str) -> Result<Option<String>, BrokerError>;

    /// Whether `session` was created by this store and has not expired.
    async fn exists(&self, session: &SessionId) -> Result<bool, BrokerError>;

    /// Moves the entries of a live `from` session to `to` and forgets `from`.
    async fn renew(&self, from: &SessionId, to: &SessionId) -> Result<(), BrokerError>;
}

struct SessionData {
    expires_at: Instant,
    values: HashMap<String, String>,
}

/// In-process session store. A session expires `ttl` after its first write.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<SessionId, SessionData>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: &SessionId, key: &str, value: String) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, data| data.expires_at > now);

        let data = sessions
            .entry(session.clone())
            .or_insert_with(|| SessionData {
                expires_at: now + self.ttl,
                values: HashMap::new(),
            });
        data.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, session: &SessionId, key: &str) -> Result<Option<String>, BrokerError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(session)
            .filter(|data| data.expires_at > Instant::now())
            .and_then(|data| data.values.get(key).cloned()))
    }

    async fn exists(&self, session: &SessionId) -> Result<bool, BrokerError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(session)
            .is_some_and(|data| data.expires_at > Instant::now()))
    }

    async fn renew(&self, from: &SessionId, to: &SessionId) -> Result<(), BrokerError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(data) = sessions.remove(from) {
            if data.expires_at > Instant::now() {
                sessions.insert(to.clone(), data);
            }
        }
        Ok(())
    }
}
