//! Operation families
//!
//! One module per route prefix. Every family implements
//! [`OperationFamily`](crate::gateway::dispatch::OperationFamily) and maps
//! its own failures into the gateway taxonomy before returning.

pub mod files;
pub mod network;
pub mod operation;
pub mod pages;
pub mod process;
pub mod query;
pub mod repos;
pub mod setting;
pub mod ssl;
pub mod time;

use crate::certs::CertificateStore;
use crate::config::GatewayConfig;
use crate::error::{CertificateError, GatewayError, ProcessError};
use crate::gateway::dispatch::{Dispatcher, Reply};
use crate::store::{ConfigStore, ConfigValue};
use crate::system::CommandError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

/// Register every family
pub fn build_dispatcher(
    config: Arc<GatewayConfig>,
    store: Arc<ConfigStore>,
    certs: Arc<CertificateStore>,
) -> Dispatcher {
    Dispatcher::new()
        .with(Arc::new(process::ProcessFamily::new(config.process.clone())))
        .with(Arc::new(network::NetworkFamily::new(config.probe_timeout, config.process.command_timeout)))
        .with(Arc::new(time::TimeFamily::new(store.clone(), config.probe_timeout, config.process.command_timeout)))
        .with(Arc::new(ssl::SslFamily::new(store.clone(), certs.clone())))
        .with(Arc::new(repos::RepositoryFamily::new(config.repo_dir.clone())))
        .with(Arc::new(setting::SettingFamily::new(store.clone(), certs.clone())))
        .with(Arc::new(operation::OperationKvFamily::new(store, certs)))
        .with(Arc::new(query::QueryFamily::new()))
        .with(Arc::new(files::FilesFamily::new(config.file_root.clone())))
        .with(Arc::new(pages::PageFamily))
        .with(Arc::new(pages::AssetFamily))
        .with(Arc::new(pages::PluginFamily::new(config.plugin_dir.clone())))
        .with(Arc::new(pages::VersionFamily))
        .with(Arc::new(pages::IndexFamily))
}

/// Serialize a value into a JSON reply
pub(crate) fn json_reply<T: Serialize>(value: T) -> Result<Reply, GatewayError> {
    serde_json::to_value(value).map(Reply::Json).map_err(|e| {
        error!("Failed to serialize reply: {}", e);
        GatewayError::Internal
    })
}

/// Refuse to switch force-HTTPS on while no matching pair is installed.
/// Every write of `server.forcehttps` goes through here.
pub(crate) async fn ensure_tls_ready(
    certs: &CertificateStore,
    section: &str,
    key: &str,
    value: &ConfigValue,
) -> Result<(), GatewayError> {
    let enabling = section == "server" && key == "forcehttps" && *value == ConfigValue::Bool(true);
    if enabling && !certs.has_valid_pair().await {
        warn!("Refusing to enable force-HTTPS without a valid certificate pair");
        return Err(CertificateError::Missing.into());
    }
    Ok(())
}

/// Classify a helper command failure outside process control
pub(crate) fn command_failure(err: CommandError) -> GatewayError {
    match err {
        CommandError::Timeout { .. } => GatewayError::Timeout,
        other => {
            warn!("Host command failed: {}", other);
            GatewayError::Process(ProcessError::Failed)
        }
    }
}
