//! Authentication Gate
//!
//! Session-cookie authentication with per-session XSRF tokens.
//!
//! # Security Features
//!
//! - **Password hashing**: Argon2id PHC strings stored in the config document
//! - **Sessions**: random 256-bit tokens held in memory, expiring after
//!   `session_ttl`; expired sessions are dropped on lookup
//! - **XSRF**: every session carries its own token; mutating privileged
//!   requests must echo it in `X-XSRFToken` (compared in constant time)
//! - **Rate limiting**: `max_login_attempts` per window per client address
//! - **Cookies**: session cookie is httpOnly and sameSite=strict
//!
//! # Public routes
//!
//! `xsrf`, `authstatus`, `login`, `logout`, `asset`, `version`, `index` and
//! the `not_found` catch-all. Everything else needs a valid session.

use super::router::RouteDescriptor;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::ConfigStore;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Cookie carrying the session token
pub const SESSION_COOKIE: &str = "hostgate_session";

/// Cookie carrying the XSRF token for browser clients
pub const XSRF_COOKIE: &str = "_xsrf";

/// Header the client echoes the XSRF token in
pub const XSRF_HEADER: &str = "x-xsrftoken";

/// Routes reachable without a session
const PUBLIC_ROUTES: &[&str] = &[
    "xsrf",
    "authstatus",
    "login",
    "logout",
    "asset",
    "plugins",
    "version",
    "index",
    "not_found",
];

/// An authenticated session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(skip)]
    pub token: String,
    pub identity: String,
    #[serde(skip)]
    pub xsrf: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a successful authorization
#[derive(Debug, Clone)]
pub enum Access {
    /// Public route; the caller's session, if any, is attached
    Public(Option<Session>),
    /// Privileged route with a valid session
    Authenticated(Session),
}

impl Access {
    pub fn identity(&self) -> Option<&str> {
        match self {
            Access::Public(session) => session.as_ref().map(|s| s.identity.as_str()),
            Access::Authenticated(session) => Some(&session.identity),
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    attempts: u32,
    window_start: DateTime<Utc>,
}

/// Session table and credential check
pub struct AuthGate {
    config: AuthConfig,
    store: Arc<ConfigStore>,
    sessions: RwLock<HashMap<String, Session>>,
    rate_limits: Mutex<HashMap<String, RateLimitEntry>>,
}

impl AuthGate {
    pub fn new(config: AuthConfig, store: Arc<ConfigStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
            rate_limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn is_public(route_name: &str) -> bool {
        PUBLIC_ROUTES.contains(&route_name)
    }

    /// Decide whether a request on `route` may proceed
    ///
    /// `mutating` is computed by the caller from the method and the family's
    /// command table.
    pub fn authorize(
        &self,
        route: &RouteDescriptor,
        mutating: bool,
        session_token: Option<&str>,
        xsrf: Option<&str>,
    ) -> Result<Access, AuthError> {
        let session = session_token.and_then(|t| self.lookup(t));

        if Self::is_public(route.name) {
            return Ok(Access::Public(session));
        }

        let session = session.ok_or(AuthError::Unauthenticated)?;

        if mutating {
            let supplied = xsrf.ok_or(AuthError::InvalidXsrf)?;
            if !constant_time_eq(supplied, &session.xsrf) {
                debug!(route = route.name, "XSRF token mismatch");
                return Err(AuthError::InvalidXsrf);
            }
        }

        Ok(Access::Authenticated(session))
    }

    /// Valid session for `token`; expired entries are removed
    pub fn lookup(&self, token: &str) -> Option<Session> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read();
            match sessions.get(token) {
                Some(session) if !session.is_expired(now) => return Some(session.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.sessions.write().remove(token);
        None
    }

    /// Check credentials and open a session
    pub async fn login(&self, username: &str, password: &str, client: &str) -> Result<Session, AuthError> {
        self.check_rate_limit(client)?;

        let doc = self.store.snapshot();
        let stored_user = doc.get_str("auth", "username").unwrap_or_default().to_string();
        let stored_hash = doc.get_str("auth", "password").unwrap_or_default().to_string();

        let user_ok = constant_time_eq(username, &stored_user);
        let password = password.to_string();
        let password_ok = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
            .await
            .unwrap_or(false);

        if !(user_ok && password_ok) {
            warn!(client = %client, "Failed login attempt");
            return Err(AuthError::InvalidCredentials);
        }

        self.rate_limits.lock().remove(client);

        let session = self.open_session(&stored_user);
        info!(user = %stored_user, client = %client, "User logged in");
        Ok(session)
    }

    fn open_session(&self, identity: &str) -> Session {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        let session = Session {
            token: random_token(),
            identity: identity.to_string(),
            xsrf: random_token(),
            issued_at: now,
            expires_at: now + ttl,
        };

        let mut sessions = self.sessions.write();
        if self.config.single_session {
            let before = sessions.len();
            sessions.retain(|_, s| s.identity != identity);
            let dropped = before - sessions.len();
            if dropped > 0 {
                info!(user = %identity, dropped, "Closed previous sessions");
            }
        }
        sessions.insert(session.token.clone(), session.clone());

        session
    }

    /// Destroy a session; returns whether one existed
    pub fn logout(&self, token: &str) -> bool {
        let removed = self.sessions.write().remove(token);
        if let Some(session) = &removed {
            info!(user = %session.identity, "User logged out");
        }
        removed.is_some()
    }

    /// XSRF token for the caller: the session's own, or a fresh unbound one
    pub fn issue_xsrf(&self, session_token: Option<&str>) -> String {
        session_token
            .and_then(|t| self.lookup(t))
            .map(|s| s.xsrf)
            .unwrap_or_else(random_token)
    }

    /// Drop every expired session and every closed rate-limit window.
    /// Returns the number of sessions removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let window = self.login_window();
        self.rate_limits
            .lock()
            .retain(|_, entry| now - entry.window_start <= window);

        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }

    fn login_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.login_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn check_rate_limit(&self, client: &str) -> Result<(), AuthError> {
        let mut rate_limits = self.rate_limits.lock();
        let now = Utc::now();
        let window = self.login_window();

        match rate_limits.get_mut(client) {
            Some(entry) if now - entry.window_start > window => {
                entry.attempts = 1;
                entry.window_start = now;
            }
            Some(entry) if entry.attempts >= self.config.max_login_attempts => {
                warn!(client = %client, "Login rate limit exceeded");
                return Err(AuthError::RateLimited);
            }
            Some(entry) => entry.attempts += 1,
            None => {
                rate_limits.insert(
                    client.to_string(),
                    RateLimitEntry {
                        attempts: 1,
                        window_start: now,
                    },
                );
            }
        }

        Ok(())
    }

    /// Cookies set after login
    pub fn login_cookies(&self, session: &Session) -> CookieJar {
        let max_age = cookie::time::Duration::seconds(self.config.session_ttl.as_secs() as i64);

        let session_cookie = Cookie::build((SESSION_COOKIE, session.token.clone()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(self.config.secure_cookies)
            .max_age(max_age)
            .build();

        CookieJar::new().add(session_cookie).add(self.xsrf_cookie(&session.xsrf))
    }

    /// Readable by page scripts so they can echo it in the header
    pub fn xsrf_cookie(&self, token: &str) -> Cookie<'static> {
        Cookie::build((XSRF_COOKIE, token.to_string()))
            .path("/")
            .same_site(SameSite::Strict)
            .secure(self.config.secure_cookies)
            .build()
    }

    /// Cookies that clear the session on the client
    pub fn logout_cookies(&self) -> CookieJar {
        let clear = |name: &'static str, http_only: bool| {
            Cookie::build((name, ""))
                .path("/")
                .http_only(http_only)
                .same_site(SameSite::Strict)
                .secure(self.config.secure_cookies)
                .max_age(cookie::time::Duration::ZERO)
                .build()
        };

        CookieJar::new()
            .add(clear(SESSION_COOKIE, true))
            .add(clear(XSRF_COOKIE, false))
    }
}

/// Hash a password with Argon2id
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Verify a password against a PHC hash; a malformed hash never verifies
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Stored password hash is malformed: {}", e);
            return false;
        }
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Client address for rate limiting
pub fn client_address(headers: &axum::http::HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip) = value.split(',').next() {
                return ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router::{FamilyId, RouteDescriptor};
    use crate::store::{ConfigDocument, ConfigValue};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn gate_with(config: AuthConfig) -> (AuthGate, TempDir) {
        let dir = TempDir::new().unwrap();
        let hash = hash_password("secret").unwrap();
        let store = ConfigStore::open(dir.path().join("config.toml"), move || {
            let mut doc = ConfigDocument::new();
            doc.insert("auth", "username", ConfigValue::Str("admin".into()));
            doc.insert("auth", "password", ConfigValue::Str(hash));
            Ok(doc)
        })
        .await
        .unwrap();
        (AuthGate::new(config, Arc::new(store)), dir)
    }

    fn route(name: &'static str) -> RouteDescriptor {
        RouteDescriptor::new(name, "/x", FamilyId::Process)
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("secure-password-123").unwrap();

        assert!(verify_password("secure-password-123", &hash));
        assert!(!verify_password("wrong-password", &hash));
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[tokio::test]
    async fn test_login_and_authorize() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        let session = gate.login("admin", "secret", "127.0.0.1").await.unwrap();
        assert_eq!(session.identity, "admin");
        assert_ne!(session.token, session.xsrf);

        let access = gate
            .authorize(&route("process"), true, Some(&session.token), Some(&session.xsrf))
            .unwrap();
        assert_eq!(access.identity(), Some("admin"));
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        let result = gate.login("admin", "nope", "127.0.0.1").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));

        let result = gate.login("root", "secret", "127.0.0.1").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        for _ in 0..5 {
            let _ = gate.login("admin", "wrong", "10.0.0.1").await;
        }

        let result = gate.login("admin", "secret", "10.0.0.1").await;
        assert!(matches!(result, Err(AuthError::RateLimited)));

        // Other clients are unaffected
        assert!(gate.login("admin", "secret", "10.0.0.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_privileged_without_session() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        let result = gate.authorize(&route("process"), false, None, None);
        assert!(matches!(result, Err(AuthError::Unauthenticated)));

        let result = gate.authorize(&route("process"), true, Some("bogus"), Some("bogus"));
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_mutating_requires_matching_xsrf() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;
        let session = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        let result = gate.authorize(&route("process"), true, Some(&session.token), None);
        assert!(matches!(result, Err(AuthError::InvalidXsrf)));

        let result = gate.authorize(&route("process"), true, Some(&session.token), Some("forged"));
        assert!(matches!(result, Err(AuthError::InvalidXsrf)));

        // Reads need no XSRF token
        assert!(gate.authorize(&route("process"), false, Some(&session.token), None).is_ok());
    }

    #[tokio::test]
    async fn test_public_routes() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        for name in PUBLIC_ROUTES {
            let access = gate.authorize(&route(*name), true, None, None).unwrap();
            assert!(matches!(access, Access::Public(None)));
        }
    }

    #[tokio::test]
    async fn test_logout_destroys_session() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;
        let session = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        assert!(gate.logout(&session.token));
        assert!(!gate.logout(&session.token));
        assert!(gate.lookup(&session.token).is_none());
    }

    #[tokio::test]
    async fn test_sessions_accumulate_without_single_session() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;

        let first = gate.login("admin", "secret", "127.0.0.1").await.unwrap();
        let second = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        assert!(gate.lookup(&first.token).is_some());
        assert!(gate.lookup(&second.token).is_some());
    }

    #[tokio::test]
    async fn test_single_session_policy() {
        let config = AuthConfig {
            single_session: true,
            ..AuthConfig::default()
        };
        let (gate, _dir) = gate_with(config).await;

        let first = gate.login("admin", "secret", "127.0.0.1").await.unwrap();
        let second = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        assert!(gate.lookup(&first.token).is_none());
        assert!(gate.lookup(&second.token).is_some());
        assert_eq!(gate.session_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let config = AuthConfig {
            session_ttl: Duration::from_millis(20),
            ..AuthConfig::default()
        };
        let (gate, _dir) = gate_with(config).await;
        let session = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = gate.authorize(&route("process"), false, Some(&session.token), None);
        assert!(matches!(result, Err(AuthError::Unauthenticated)));
        assert_eq!(gate.session_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let config = AuthConfig {
            session_ttl: Duration::from_millis(10),
            ..AuthConfig::default()
        };
        let (gate, _dir) = gate_with(config).await;
        gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gate.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_closed_rate_limit_windows() {
        let config = AuthConfig {
            login_window: Duration::from_millis(200),
            ..AuthConfig::default()
        };
        let (gate, _dir) = gate_with(config).await;
        gate.check_rate_limit("10.0.0.1").unwrap();
        gate.check_rate_limit("10.0.0.2").unwrap();

        gate.purge_expired();
        assert_eq!(gate.rate_limits.lock().len(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        gate.check_rate_limit("10.0.0.3").unwrap();
        gate.purge_expired();

        let remaining = gate.rate_limits.lock();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_issue_xsrf() {
        let (gate, _dir) = gate_with(AuthConfig::default()).await;
        let session = gate.login("admin", "secret", "127.0.0.1").await.unwrap();

        assert_eq!(gate.issue_xsrf(Some(&session.token)), session.xsrf);

        let unbound = gate.issue_xsrf(None);
        assert_eq!(unbound.len(), 64);
        assert_ne!(unbound, session.xsrf);
    }

    #[test]
    fn test_client_address() {
        let mut headers = axum::http::HeaderMap::new();
        assert_eq!(client_address(&headers), "unknown");

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_address(&headers), "203.0.113.9");
    }
}
