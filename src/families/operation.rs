//! Generic key/value access to the settings document
//!
//! Parameters come from the JSON body or the query string. The `auth`
//! section is reachable only through the setting family, which checks the
//! current password.

use super::{ensure_tls_ready, json_reply};
use crate::certs::CertificateStore;
use crate::error::{ConfigError, GatewayError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::store::{ConfigStore, ConfigValue};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("sections"),
    CommandSpec::read("items"),
    CommandSpec::read("get"),
    CommandSpec::write("set"),
    CommandSpec::write("delete"),
];

const PROTECTED_SECTIONS: &[&str] = &["auth"];

pub struct OperationKvFamily {
    store: Arc<ConfigStore>,
    certs: Arc<CertificateStore>,
}

impl OperationKvFamily {
    pub fn new(store: Arc<ConfigStore>, certs: Arc<CertificateStore>) -> Self {
        Self { store, certs }
    }
}

fn section_param(ctx: &RequestContext) -> Result<String, GatewayError> {
    let section = ctx
        .field("section")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("Missing 'section'".to_string()))?;

    if PROTECTED_SECTIONS.contains(&section.as_str()) {
        return Err(ConfigError::NotFound(format!("Section {}", section)).into());
    }
    if !section.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ConfigError::Invalid(format!("Invalid section name '{}'", section)).into());
    }
    Ok(section)
}

fn key_param(ctx: &RequestContext) -> Result<String, GatewayError> {
    let key = ctx
        .field("key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("Missing 'key'".to_string()))?;

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(ConfigError::Invalid(format!("Invalid key name '{}'", key)).into());
    }
    Ok(key)
}

#[async_trait]
impl OperationFamily for OperationKvFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Operation
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "sections" => {
                let sections: Vec<String> = self
                    .store
                    .sections()
                    .into_iter()
                    .filter(|s| !PROTECTED_SECTIONS.contains(&s.as_str()))
                    .collect();
                json_reply(json!({ "sections": sections }))
            }
            "items" => {
                let section = section_param(&ctx)?;
                json_reply(json!({ "section": section, "items": self.store.section(&section)? }))
            }
            "get" => {
                let section = section_param(&ctx)?;
                let key = key_param(&ctx)?;
                let value = self.store.get(&section, &key)?;
                json_reply(json!({ "section": section, "key": key, "value": value }))
            }
            "set" => {
                let section = section_param(&ctx)?;
                let key = key_param(&ctx)?;
                // Keep the JSON type when the body carries one
                let input = match ctx.body.get("value") {
                    Some(value) => value.clone(),
                    None => ctx
                        .query
                        .get("value")
                        .map(|v| Value::String(v.clone()))
                        .ok_or_else(|| GatewayError::BadRequest("Missing 'value'".to_string()))?,
                };

                let value = ConfigValue::from_json(&section, &key, &input)?;
                ensure_tls_ready(&self.certs, &section, &key, &value).await?;
                self.store.set(&section, &key, value.clone()).await?;
                info!(section = %section, key = %key, "Setting changed");
                json_reply(json!({ "ok": true, "section": section, "key": key, "value": value }))
            }
            "delete" => {
                let section = section_param(&ctx)?;
                let key = key_param(&ctx)?;
                let value = self.store.remove(&section, &key).await?;
                info!(section = %section, key = %key, "Setting removed");
                json_reply(json!({ "ok": true, "section": section, "key": key, "value": value }))
            }
            other => Err(GatewayError::UnsupportedOperation(format!("operation/{}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router::PatternRouter;
    use crate::store::ConfigDocument;
    use axum::http::Method;
    use tempfile::TempDir;

    async fn family(dir: &TempDir) -> OperationKvFamily {
        let ssl = dir.path().join("ssl");
        let store = ConfigStore::open(dir.path().join("config.toml"), move || {
            let mut doc = ConfigDocument::new();
            doc.insert("server", "port", ConfigValue::Int(8888));
            doc.insert("server", "forcehttps", ConfigValue::Bool(false));
            doc.insert("server", "sslcrt", ConfigValue::Str(ssl.join("server.crt").display().to_string()));
            doc.insert("server", "sslkey", ConfigValue::Str(ssl.join("server.key").display().to_string()));
            doc.insert("auth", "username", ConfigValue::Str("admin".into()));
            Ok(doc)
        })
        .await
        .unwrap();
        let store = Arc::new(store);
        OperationKvFamily::new(store.clone(), Arc::new(CertificateStore::new(store)))
    }

    fn ctx(path: &str, body: Value) -> RequestContext {
        let router = PatternRouter::with_default_routes().unwrap();
        let m = router.resolve(path).unwrap();
        RequestContext::from_match(&m, Method::POST).with_body(body)
    }

    fn json_of(reply: Reply) -> Value {
        match reply {
            Reply::Json(v) => v,
            other => panic!("expected JSON reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let family = family(&dir).await;

        family
            .execute(ctx(
                "/api/operation/set",
                json!({ "section": "panel", "key": "theme", "value": "dark" }),
            ))
            .await
            .unwrap();

        let body = json_of(
            family
                .execute(ctx("/api/operation/get", json!({ "section": "panel", "key": "theme" })))
                .await
                .unwrap(),
        );
        assert_eq!(body["value"], "dark");

        family
            .execute(ctx("/api/operation/delete", json!({ "section": "panel", "key": "theme" })))
            .await
            .unwrap();
        let err = family
            .execute(ctx("/api/operation/get", json!({ "section": "panel", "key": "theme" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError.NotFound");
    }

    #[tokio::test]
    async fn test_typed_key_coerced_from_query() {
        let dir = TempDir::new().unwrap();
        let family = family(&dir).await;

        let mut query = std::collections::HashMap::new();
        query.insert("section".to_string(), "server".to_string());
        query.insert("key".to_string(), "port".to_string());
        query.insert("value".to_string(), "9090".to_string());

        let body = json_of(
            family
                .execute(ctx("/api/operation/set", Value::Null).with_query(query))
                .await
                .unwrap(),
        );
        assert_eq!(body["value"], 9090);
    }

    #[tokio::test]
    async fn test_auth_section_is_hidden() {
        let dir = TempDir::new().unwrap();
        let family = family(&dir).await;

        let body = json_of(family.execute(ctx("/api/operation/sections", Value::Null)).await.unwrap());
        let sections = body["sections"].as_array().unwrap();
        assert!(sections.iter().all(|s| s != "auth"));

        let err = family
            .execute(ctx(
                "/api/operation/set",
                json!({ "section": "auth", "key": "username", "value": "root" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError.NotFound");
    }

    #[tokio::test]
    async fn test_missing_parameters() {
        let dir = TempDir::new().unwrap();
        let family = family(&dir).await;

        let err = family
            .execute(ctx("/api/operation/items", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn test_force_https_needs_installed_pair() {
        let dir = TempDir::new().unwrap();
        let family = family(&dir).await;

        let err = family
            .execute(ctx(
                "/api/operation/set",
                json!({ "section": "server", "key": "forcehttps", "value": true }),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CertificateError.Missing");
        assert_eq!(family.store.get("server", "forcehttps").unwrap(), ConfigValue::Bool(false));

        // Switching it off never needs a pair
        family
            .execute(ctx(
                "/api/operation/set",
                json!({ "section": "server", "key": "forcehttps", "value": "off" }),
            ))
            .await
            .unwrap();

        family.certs.generate("panel.local").await.unwrap();
        let body = json_of(
            family
                .execute(ctx(
                    "/api/operation/set",
                    json!({ "section": "server", "key": "forcehttps", "value": true }),
                ))
                .await
                .unwrap(),
        );
        assert_eq!(body["value"], true);
    }
}
