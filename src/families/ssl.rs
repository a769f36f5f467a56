//! SSL certificate management
//!
//! TLS settings are read once at startup, so every command that changes
//! them reports `restart_required`.

use super::{ensure_tls_ready, json_reply};
use crate::certs::CertificateStore;
use crate::error::{CertificateError, GatewayError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::store::{ConfigStore, ConfigValue};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("status"),
    CommandSpec::write("generate"),
    CommandSpec::write("upload"),
    CommandSpec::write("forcehttps"),
];

/// Upper bound of an X.520 common name
const MAX_COMMON_NAME: usize = 64;

pub struct SslFamily {
    store: Arc<ConfigStore>,
    certs: Arc<CertificateStore>,
}

impl SslFamily {
    pub fn new(store: Arc<ConfigStore>, certs: Arc<CertificateStore>) -> Self {
        Self { store, certs }
    }

    fn force_https(&self) -> bool {
        self.store
            .snapshot()
            .get_bool("server", "forcehttps")
            .unwrap_or(false)
    }

    async fn status(&self) -> Result<Reply, GatewayError> {
        let forcehttps = self.force_https();
        match self.certs.status().await {
            Ok(record) => json_reply(json!({
                "installed": true,
                "forcehttps": forcehttps,
                "certificate": record,
            })),
            Err(CertificateError::Missing) => json_reply(json!({
                "installed": false,
                "forcehttps": forcehttps,
            })),
            Err(e) => json_reply(json!({
                "installed": false,
                "forcehttps": forcehttps,
                "problem": e.to_string(),
            })),
        }
    }

    async fn generate(&self, common_name: &str) -> Result<Reply, GatewayError> {
        let common_name = common_name.trim();
        if common_name.is_empty()
            || common_name.len() > MAX_COMMON_NAME
            || common_name.chars().any(|c| c.is_control())
        {
            return Err(CertificateError::Invalid(format!(
                "Common name must be 1-{} printable characters",
                MAX_COMMON_NAME
            ))
            .into());
        }

        let record = self.certs.generate(common_name).await?;
        info!(common_name = %common_name, "Generated self-signed certificate");

        json_reply(json!({
            "ok": true,
            "certificate": record,
            "restart_required": true,
        }))
    }

    async fn upload(&self, ctx: &RequestContext) -> Result<Reply, GatewayError> {
        let cert = ctx
            .field("cert")
            .ok_or_else(|| GatewayError::BadRequest("Missing 'cert'".to_string()))?;
        let key = ctx
            .field("key")
            .ok_or_else(|| GatewayError::BadRequest("Missing 'key'".to_string()))?;

        let record = self.certs.install(&cert, &key).await?;
        info!(common_name = %record.common_name, "Installed uploaded certificate");

        json_reply(json!({
            "ok": true,
            "certificate": record,
            "restart_required": true,
        }))
    }

    async fn set_force_https(&self, mode: &str) -> Result<Reply, GatewayError> {
        let enable = match mode {
            "on" => true,
            "off" => false,
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "Expected 'on' or 'off', got '{}'",
                    other
                )))
            }
        };

        let value = ConfigValue::Bool(enable);
        ensure_tls_ready(&self.certs, "server", "forcehttps", &value).await?;

        self.store.set("server", "forcehttps", value).await?;
        info!(forcehttps = enable, "Force-HTTPS changed");

        json_reply(json!({
            "ok": true,
            "forcehttps": enable,
            "restart_required": true,
        }))
    }
}

#[async_trait]
impl OperationFamily for SslFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Ssl
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "status" => self.status().await,
            "generate" => self.generate(ctx.require_arg()?).await,
            "upload" => self.upload(&ctx).await,
            "forcehttps" => self.set_force_https(ctx.require_arg()?).await,
            other => Err(GatewayError::UnsupportedOperation(format!("ssl/{}", other))),
        }
    }
}
