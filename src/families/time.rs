//! Time and timezone
//!
//! Clock inspection, timezone listing and switching, and SNTP query/sync.
//! Timezone changes go through `timedatectl`; clock changes through `date`.
//! Both run with the command timeout and are reaped on expiry.

use super::{command_failure, json_reply};
use crate::error::{ConfigError, GatewayError, ProcessError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::store::{ConfigStore, ConfigValue};
use crate::system;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, warn};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("datetime"),
    CommandSpec::read("timezone"),
    CommandSpec::read("timezones"),
    CommandSpec::write("settimezone"),
    CommandSpec::read("ntpquery"),
    CommandSpec::write("ntpsync"),
];

const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";
const NTP_PORT: u16 = 123;

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

static TZ_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_+\-]+(?:/[A-Za-z0-9_+\-]+)*$").unwrap());

#[derive(Debug, Error)]
enum NtpError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply")]
    Timeout,
    #[error("invalid reply")]
    InvalidReply,
}

impl From<NtpError> for GatewayError {
    fn from(err: NtpError) -> Self {
        match err {
            NtpError::Resolve(server) => {
                GatewayError::BadRequest(format!("Cannot resolve NTP server '{}'", server))
            }
            NtpError::Timeout => GatewayError::Timeout,
            NtpError::InvalidReply => {
                GatewayError::BadRequest("NTP server returned an invalid reply".to_string())
            }
            NtpError::Io(e) => {
                warn!("NTP socket error: {}", e);
                GatewayError::Internal
            }
        }
    }
}

/// Result of one SNTP exchange
#[derive(Debug, Serialize)]
pub struct NtpReading {
    pub server: String,
    pub server_time: DateTime<Utc>,
    /// Server clock minus local clock
    pub offset_ms: i64,
}

pub struct TimeFamily {
    store: Arc<ConfigStore>,
    zoneinfo: PathBuf,
    localtime: PathBuf,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl TimeFamily {
    pub fn new(store: Arc<ConfigStore>, probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            store,
            zoneinfo: PathBuf::from("/usr/share/zoneinfo"),
            localtime: PathBuf::from("/etc/localtime"),
            probe_timeout,
            command_timeout,
        }
    }

    async fn current_timezone(&self) -> Option<String> {
        let target = tokio::fs::read_link(&self.localtime).await.ok()?;
        let target = target.to_string_lossy();
        target
            .split_once("zoneinfo/")
            .map(|(_, tz)| tz.to_string())
    }

    async fn timezones(&self, region: Option<&str>) -> Result<Vec<String>, GatewayError> {
        let regions = list_regions(&self.zoneinfo).await;
        let Some(region) = region else {
            return Ok(regions);
        };

        if !regions.iter().any(|r| r == region) {
            return Err(GatewayError::BadRequest(format!("Unknown region '{}'", region)));
        }
        Ok(list_zones(&self.zoneinfo, region).await)
    }

    async fn set_timezone(&self, tz: &str) -> Result<Reply, GatewayError> {
        if !TZ_NAME.is_match(tz) || !tokio::fs::metadata(self.zoneinfo.join(tz)).await.is_ok_and(|m| m.is_file()) {
            return Err(ConfigError::Invalid(format!("Unknown timezone '{}'", tz)).into());
        }

        let output = system::run(&["timedatectl", "set-timezone", tz], self.command_timeout)
            .await
            .map_err(command_failure)?;
        if !output.success() {
            warn!(timezone = %tz, stderr = %output.stderr.trim(), "timedatectl failed");
            return Err(ProcessError::Failed.into());
        }

        self.store
            .set("time", "timezone", ConfigValue::Str(tz.to_string()))
            .await?;

        info!(timezone = %tz, "Timezone changed");
        json_reply(serde_json::json!({ "ok": true, "timezone": tz }))
    }

    fn ntp_server(&self, arg: Option<&str>) -> String {
        arg.filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.store
                    .snapshot()
                    .get_str("time", "ntpserver")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_NTP_SERVER.to_string())
    }

    async fn ntp_sync(&self, server: &str) -> Result<Reply, GatewayError> {
        let reading = sntp_query(server, self.probe_timeout).await?;
        let secs = reading.server_time.timestamp();

        let stamp = format!("@{}", secs);
        let output = system::run(&["date", "-u", "-s", stamp.as_str()], self.command_timeout)
            .await
            .map_err(command_failure)?;
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "Setting the clock failed");
            return Err(ProcessError::Failed.into());
        }

        info!(server = %reading.server, offset_ms = reading.offset_ms, "Clock synchronized");
        json_reply(serde_json::json!({
            "ok": true,
            "server": reading.server,
            "synced_to": reading.server_time,
            "offset_ms": reading.offset_ms,
        }))
    }
}

#[async_trait]
impl OperationFamily for TimeFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Time
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "datetime" => {
                let now = Local::now();
                json_reply(serde_json::json!({
                    "datetime": now.to_rfc3339(),
                    "utc": now.with_timezone(&Utc).to_rfc3339(),
                    "timestamp": now.timestamp(),
                }))
            }
            "timezone" => {
                let configured = self.store.snapshot().get_str("time", "timezone").map(str::to_string);
                json_reply(serde_json::json!({
                    "timezone": self.current_timezone().await,
                    "configured": configured,
                }))
            }
            "timezones" => {
                let zones = self.timezones(ctx.arg.as_deref()).await?;
                json_reply(serde_json::json!({ "timezones": zones }))
            }
            "settimezone" => self.set_timezone(ctx.require_arg()?).await,
            "ntpquery" => {
                let server = self.ntp_server(ctx.arg.as_deref());
                json_reply(sntp_query(&server, self.probe_timeout).await?)
            }
            "ntpsync" => {
                let server = self.ntp_server(ctx.arg.as_deref());
                self.ntp_sync(&server).await
            }
            other => Err(GatewayError::UnsupportedOperation(format!("time/{}", other))),
        }
    }
}

/// Top-level zone regions (`Africa`, `America`, ..., `Etc`)
async fn list_regions(zoneinfo: &Path) -> Vec<String> {
    let mut regions = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(zoneinfo).await else {
        return regions;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if is_dir && name.starts_with(|c: char| c.is_ascii_uppercase()) && name != "SystemV" {
            regions.push(name);
        }
    }
    regions.sort();
    regions
}

/// Zones under a region, as `Region/City` (nested: `Region/Sub/City`)
async fn list_zones(zoneinfo: &Path, region: &str) -> Vec<String> {
    let mut zones = Vec::new();
    let mut pending = vec![region.to_string()];

    while let Some(prefix) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(zoneinfo.join(&prefix)).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let zone = format!("{}/{}", prefix, name);
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(zone),
                Ok(_) => zones.push(zone),
                Err(_) => {}
            }
        }
    }
    zones.sort();
    zones
}

/// `host` or `host:port`
fn ntp_target(server: &str) -> (String, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (server.to_string(), NTP_PORT),
        },
        _ => (server.to_string(), NTP_PORT),
    }
}

/// One SNTP (RFC 4330) client exchange
async fn sntp_query(server: &str, timeout: Duration) -> Result<NtpReading, NtpError> {
    let (host, port) = ntp_target(server);

    let addr = tokio::time::timeout(timeout, tokio::net::lookup_host((host.as_str(), port)))
        .await
        .map_err(|_| NtpError::Timeout)?
        .map_err(|_| NtpError::Resolve(host.clone()))?
        .next()
        .ok_or_else(|| NtpError::Resolve(host.clone()))?;

    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let mut request = [0u8; 48];
    // LI = 0, VN = 3, Mode = 3 (client)
    request[0] = 0x1B;

    let sent_at = SystemTime::now();
    socket.send(&request).await?;

    let mut reply = [0u8; 48];
    let len = tokio::time::timeout(timeout, socket.recv(&mut reply))
        .await
        .map_err(|_| NtpError::Timeout)??;
    let received_at = SystemTime::now();

    let server_time = parse_transmit_time(&reply[..len])?;

    let sent_ms = unix_millis(sent_at);
    let received_ms = unix_millis(received_at);
    let local_mid = sent_ms + (received_ms - sent_ms) / 2;

    Ok(NtpReading {
        server: server.to_string(),
        server_time,
        offset_ms: server_time.timestamp_millis() - local_mid,
    })
}

/// Transmit timestamp (bytes 40..48) of a server-mode reply
fn parse_transmit_time(reply: &[u8]) -> Result<DateTime<Utc>, NtpError> {
    if reply.len() < 48 {
        return Err(NtpError::InvalidReply);
    }
    let mode = reply[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(NtpError::InvalidReply);
    }

    let secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    let fraction = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]) as u64;
    if secs < NTP_UNIX_OFFSET {
        return Err(NtpError::InvalidReply);
    }

    let nanos = (fraction * 1_000_000_000) >> 32;
    DateTime::from_timestamp((secs - NTP_UNIX_OFFSET) as i64, nanos as u32).ok_or(NtpError::InvalidReply)
}

fn unix_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
