//! Gateway HTTP Server
//!
//! A single axum fallback handler runs every request through the pipeline:
//!
//! ```text
//! path ──► PatternRouter ──► AuthGate ──► Dispatcher ──► family
//!              │                 │
//!              └─ not_found      └─ auth endpoints (login, logout, xsrf,
//!                                   authstatus) answered here: they set
//!                                   cookies
//! ```
//!
//! TLS, when enabled by `server.forcehttps`, is decided once at startup.

use super::auth::{client_address, Access, AuthGate, SESSION_COOKIE, XSRF_HEADER};
use super::dispatch::{Dispatcher, RequestContext};
use super::router::{FamilyId, PatternRouter};
use crate::certs::CertificateStore;
use crate::config::GatewayConfig;
use crate::error::{ConfigError, GatewayError};
use crate::families;
use crate::store::{ConfigDocument, ConfigStore, ConfigValue};
use crate::system::PidFile;
use crate::tls::{self, ClientAddr, TlsListener};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{connect_info::ConnectInfo, Query, Request, State},
    http::{Method, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest accepted request body (file uploads arrive base64-encoded)
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How often expired sessions are swept
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Default settings document written on first start
pub fn default_document(config: &GatewayConfig) -> Result<ConfigDocument, ConfigError> {
    let ssl_dir = config.ssl_dir();
    let password = super::auth::hash_password("admin").map_err(|e| {
        error!("Failed to hash default password: {}", e);
        ConfigError::Invalid("failed to hash default password".to_string())
    })?;

    let mut doc = ConfigDocument::new();
    doc.insert("server", "ip", ConfigValue::Str("0.0.0.0".to_string()));
    doc.insert("server", "port", ConfigValue::Int(8888));
    doc.insert("server", "forcehttps", ConfigValue::Bool(false));
    doc.insert(
        "server",
        "sslkey",
        ConfigValue::Str(ssl_dir.join("server.key").display().to_string()),
    );
    doc.insert(
        "server",
        "sslcrt",
        ConfigValue::Str(ssl_dir.join("server.crt").display().to_string()),
    );
    doc.insert("auth", "username", ConfigValue::Str("admin".to_string()));
    doc.insert("auth", "password", ConfigValue::Str(password));
    doc.insert("runtime", "mode", ConfigValue::Str("prod".to_string()));
    doc.insert("time", "timezone", ConfigValue::Str(String::new()));
    doc.insert("time", "ntpserver", ConfigValue::Str("pool.ntp.org".to_string()));
    Ok(doc)
}

/// Everything a request needs, shared by `Arc`
pub struct Gateway {
    config: Arc<GatewayConfig>,
    store: Arc<ConfigStore>,
    auth: Arc<AuthGate>,
    certs: Arc<CertificateStore>,
    router: PatternRouter,
    dispatcher: Dispatcher,
}

impl Gateway {
    /// Open the settings store and wire up every component
    pub async fn open(config: GatewayConfig) -> Result<Self> {
        let store = ConfigStore::open(&config.config_file, || default_document(&config))
            .await
            .with_context(|| format!("Failed to open config {}", config.config_file.display()))?;
        let store = Arc::new(store);

        let mut config = config;
        if store.snapshot().get_bool("server", "forcehttps").unwrap_or(false) {
            config.auth.secure_cookies = true;
        }
        let config = Arc::new(config);

        let auth = Arc::new(AuthGate::new(config.auth.clone(), store.clone()));
        let certs = Arc::new(CertificateStore::new(store.clone()));
        let router = PatternRouter::with_default_routes().context("Invalid route table")?;
        let dispatcher = families::build_dispatcher(config.clone(), store.clone(), certs.clone());

        Ok(Self {
            config,
            store,
            auth,
            certs,
            router,
            dispatcher,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn certs(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    /// Build the axum app
    pub fn app(self: &Arc<Self>) -> Router {
        let mut router = Router::new().fallback(handle).with_state(self.clone());

        if self.config.log_requests {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until Ctrl+C / SIGTERM
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let pid_file = PidFile::create(&self.config.pid_file)
            .await
            .with_context(|| format!("Failed to write PID file {}", self.config.pid_file.display()))?;

        let doc = self.store.snapshot();
        let ip: IpAddr = doc
            .get_str("server", "ip")
            .unwrap_or("0.0.0.0")
            .parse()
            .context("server.ip is not an IP address")?;
        let port = doc.get_int("server", "port").unwrap_or(8888);
        let port = u16::try_from(port).context("server.port is out of range")?;
        let addr = SocketAddr::new(ip, port);
        let force_https = doc.get_bool("server", "forcehttps").unwrap_or(false);
        let scheme = if force_https { "https" } else { "http" };

        info!(
            config_file = %self.config.config_file.display(),
            pid_file = %pid_file.path().display(),
            data_dir = %self.config.data_dir.display(),
            scheme,
            address = %addr,
            "Starting hostgate"
        );

        let sweeper = {
            let auth = self.auth.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    let purged = auth.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired sessions");
                    }
                }
            })
        };

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let app = self.app().into_make_service_with_connect_info::<ClientAddr>();

        info!("Gateway available at {}://{}", scheme, addr);

        let served = if force_https {
            let (cert, key) = self
                .certs
                .load_pair()
                .await
                .context("Force-HTTPS is on but no valid certificate pair is installed")?;
            let tls_config = tls::server_config(&cert, &key)?;
            let listener = TlsListener::new(listener, tls_config)?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        };

        sweeper.abort();
        served?;

        info!("Gateway shut down gracefully");
        drop(pid_file);
        Ok(())
    }

    /// Route, authorize and dispatch one request
    async fn pipeline(&self, request: Request) -> Result<Response, GatewayError> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<ClientAddr>>()
            .map(|ConnectInfo(ClientAddr(addr))| addr.ip().to_string());
        let (parts, body) = request.into_parts();
        let method = parts.method;
        let uri = parts.uri;
        let headers = parts.headers;

        let route_match = self
            .router
            .resolve(uri.path())
            .ok_or(GatewayError::RouteNotFound)?;
        let family = route_match.route.family;
        let ctx = RequestContext::from_match(&route_match, method.clone());

        let mutating = !matches!(method, Method::GET | Method::HEAD | Method::OPTIONS)
            || self.dispatcher.is_mutating(family, &ctx.command);

        let jar = CookieJar::from_headers(&headers);
        let session_token = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
        let xsrf = headers.get(XSRF_HEADER).and_then(|v| v.to_str().ok());

        let access = self
            .auth
            .authorize(route_match.route, mutating, session_token.as_deref(), xsrf)?;

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|_| GatewayError::BadRequest("Request body is too large".to_string()))?;
        let body = parse_body(&body)?;

        match family {
            FamilyId::NotFound => Err(GatewayError::RouteNotFound),
            FamilyId::Auth => {
                let client = peer.unwrap_or_else(|| client_address(&headers));
                self.auth_endpoint(&ctx.command, &method, &access, session_token.as_deref(), &body, &client)
                    .await
            }
            _ => {
                let ctx = ctx
                    .with_query(parse_query(&uri))
                    .with_body(body)
                    .with_identity(access.identity().map(str::to_string));
                let reply = self.dispatcher.dispatch(family, ctx).await?;
                Ok(reply.into_response())
            }
        }
    }

    async fn auth_endpoint(
        &self,
        command: &str,
        method: &Method,
        access: &Access,
        session_token: Option<&str>,
        body: &Value,
        client: &str,
    ) -> Result<Response, GatewayError> {
        match command {
            "xsrf" => {
                let token = self.auth.issue_xsrf(session_token);
                let jar = CookieJar::new().add(self.auth.xsrf_cookie(&token));
                Ok((jar, Json(json!({ "xsrf": token }))).into_response())
            }
            "authstatus" => {
                let user = access.identity();
                Ok(Json(json!({ "authed": user.is_some(), "user": user })).into_response())
            }
            "login" => {
                if *method != Method::POST {
                    return Err(GatewayError::UnsupportedOperation("login requires POST".to_string()));
                }
                let field = |names: &[&str]| {
                    names
                        .iter()
                        .find_map(|n| body.get(*n).and_then(Value::as_str))
                        .map(str::to_string)
                };
                let user = field(&["user", "username"])
                    .ok_or_else(|| GatewayError::BadRequest("Missing 'user'".to_string()))?;
                let pass = field(&["pass", "password"])
                    .ok_or_else(|| GatewayError::BadRequest("Missing 'pass'".to_string()))?;

                let session = self.auth.login(&user, &pass, client).await?;
                let jar = self.auth.login_cookies(&session);
                Ok((
                    jar,
                    Json(json!({
                        "authed": true,
                        "user": session.identity,
                        "xsrf": session.xsrf,
                        "expires_at": session.expires_at,
                    })),
                )
                    .into_response())
            }
            "logout" => {
                if let Some(token) = session_token {
                    self.auth.logout(token);
                }
                Ok((self.auth.logout_cookies(), Json(json!({ "ok": true }))).into_response())
            }
            other => Err(GatewayError::UnsupportedOperation(other.to_string())),
        }
    }
}

async fn handle(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match gateway.pipeline(request).await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                error!(method = %method, path = %path, kind = e.kind(), "Request failed");
            } else {
                debug!(method = %method, path = %path, kind = e.kind(), "Request rejected");
            }
            e.into_response()
        }
    }
}

/// JSON body, `Null` when empty
fn parse_body(body: &Bytes) -> Result<Value, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|_| GatewayError::BadRequest("Request body is not valid JSON".to_string()))
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(query)| query)
        .unwrap_or_default()
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Open the gateway and serve it
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let gateway = Arc::new(Gateway::open(config).await?);
    gateway.run().await
}
