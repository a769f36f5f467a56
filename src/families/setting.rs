//! Server settings
//!
//! `GET /api/setting/{section}` reads a section; any other method writes it.
//! A write commits every supplied key in one store transaction, so a bad
//! value leaves the whole section untouched.

use super::{ensure_tls_ready, json_reply};
use crate::certs::CertificateStore;
use crate::error::{AuthError, ConfigError, GatewayError};
use crate::gateway::auth::{hash_password, verify_password};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::store::{schema_keys, ConfigEntry, ConfigStore, ConfigValue};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info};

// Writes are recognized by method, not by command
const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("server"),
    CommandSpec::read("auth"),
    CommandSpec::read("runtime"),
    CommandSpec::read("time"),
];

pub struct SettingFamily {
    store: Arc<ConfigStore>,
    certs: Arc<CertificateStore>,
}

impl SettingFamily {
    pub fn new(store: Arc<ConfigStore>, certs: Arc<CertificateStore>) -> Self {
        Self { store, certs }
    }

    fn read(&self, section: &str) -> Result<Reply, GatewayError> {
        let entries = match self.store.section(section) {
            Ok(entries) => entries,
            Err(ConfigError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        json_reply(json!({ "section": section, "values": visible(entries) }))
    }

    async fn write_section(&self, section: &str, body: &Map<String, Value>) -> Result<Reply, GatewayError> {
        let allowed = schema_keys(section);
        let mut values = Vec::with_capacity(body.len());
        for (key, input) in body {
            if !allowed.contains(&key.as_str()) {
                return Err(ConfigError::Invalid(format!("Unknown setting '{}.{}'", section, key)).into());
            }
            let value = ConfigValue::from_json(section, key, input)?;
            ensure_tls_ready(&self.certs, section, key, &value).await?;
            values.push((key.clone(), value));
        }
        if values.is_empty() {
            return Err(GatewayError::BadRequest("Nothing to update".to_string()));
        }

        self.store
            .update(|doc| {
                for (key, value) in &values {
                    doc.insert(section, key, value.clone());
                }
                Ok(())
            })
            .await?;

        info!(section = %section, keys = values.len(), "Settings updated");
        json_reply(json!({
            "ok": true,
            "section": section,
            "values": visible(self.store.section(section)?),
            "restart_required": section == "server",
        }))
    }

    async fn write_auth(&self, body: &Map<String, Value>) -> Result<Reply, GatewayError> {
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);

        let current = field("current_password")
            .ok_or_else(|| GatewayError::BadRequest("Missing 'current_password'".to_string()))?;
        let username = field("username");
        let password = field("password");

        if let Some(name) = &username {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("Username must not be empty".to_string()).into());
            }
        }
        if let Some(pass) = &password {
            if pass.is_empty() {
                return Err(ConfigError::Invalid("Password must not be empty".to_string()).into());
            }
        }
        if username.is_none() && password.is_none() {
            return Err(GatewayError::BadRequest("Nothing to update".to_string()));
        }

        let stored_hash = self
            .store
            .snapshot()
            .get_str("auth", "password")
            .unwrap_or_default()
            .to_string();
        let verified = blocking(move || verify_password(&current, &stored_hash)).await?;
        if !verified {
            return Err(AuthError::InvalidCredentials.into());
        }

        let new_hash = match password {
            Some(pass) => Some(blocking(move || hash_password(&pass)).await?.map_err(|e| {
                error!("Failed to hash password: {}", e);
                GatewayError::Internal
            })?),
            None => None,
        };

        self.store
            .update(|doc| {
                if let Some(name) = &username {
                    doc.insert("auth", "username", ConfigValue::Str(name.trim().to_string()));
                }
                if let Some(hash) = &new_hash {
                    doc.insert("auth", "password", ConfigValue::Str(hash.clone()));
                }
                Ok(())
            })
            .await?;

        info!(
            username_changed = username.is_some(),
            password_changed = new_hash.is_some(),
            "Credentials updated"
        );
        json_reply(json!({
            "ok": true,
            "section": "auth",
            "values": visible(self.store.section("auth")?),
        }))
    }
}

#[async_trait]
impl OperationFamily for SettingFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Setting
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let section = ctx.command.as_str();
        if ctx.is_read() {
            return self.read(section);
        }

        let body = ctx
            .body
            .as_object()
            .ok_or_else(|| GatewayError::BadRequest("Expected a JSON object".to_string()))?;

        if section == "auth" {
            self.write_auth(body).await
        } else {
            self.write_section(section, body).await
        }
    }
}

/// Section entries as a key/value object; the password hash never leaves
fn visible(entries: Vec<ConfigEntry>) -> Map<String, Value> {
    entries
        .into_iter()
        .filter(|e| !(e.section == "auth" && e.key == "password"))
        .filter_map(|e| serde_json::to_value(&e.value).ok().map(|v| (e.key, v)))
        .collect()
}

async fn blocking<F, T>(f: F) -> Result<T, GatewayError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("Blocking task failed: {}", e);
        GatewayError::Internal
    })
}
