//! Network inspection
//!
//! Read-only view of interfaces, resolvers and the default route, plus a
//! TCP connectivity probe.

use super::json_reply;
use crate::error::GatewayError;
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::system;
use async_trait::async_trait;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("hostname"),
    CommandSpec::read("ifnames"),
    CommandSpec::read("ifconfig"),
    CommandSpec::read("nameservers"),
    CommandSpec::read("gateway"),
    CommandSpec::read("probe"),
];

// ===== Types =====

/// Interface details
#[derive(Debug, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    /// Link state as reported by the kernel (`up`, `down`, `unknown`)
    pub operstate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Addresses in CIDR notation
    pub addresses: Vec<String>,
}

/// Default route
#[derive(Debug, Serialize, PartialEq)]
pub struct DefaultRoute {
    pub interface: String,
    pub gateway: String,
}

/// TCP probe result
#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

pub struct NetworkFamily {
    sys_net: PathBuf,
    resolv_conf: PathBuf,
    route_table: PathBuf,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl NetworkFamily {
    pub fn new(probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            sys_net: PathBuf::from("/sys/class/net"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            route_table: PathBuf::from("/proc/net/route"),
            probe_timeout,
            command_timeout,
        }
    }

    async fn interface(&self, name: &str) -> Result<InterfaceInfo, GatewayError> {
        let names = list_interfaces(&self.sys_net).await;
        if !names.iter().any(|n| n == name) {
            return Err(GatewayError::BadRequest(format!("Unknown interface '{}'", name)));
        }

        let dir = self.sys_net.join(name);
        let read = |file: &'static str| {
            let path = dir.join(file);
            async move {
                tokio::fs::read_to_string(path)
                    .await
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            }
        };

        let operstate = read("operstate").await.unwrap_or_else(|| "unknown".to_string());
        let mac = read("address").await;
        let mtu = read("mtu").await.and_then(|s| s.parse().ok());
        let addresses = self.addresses(name).await;

        Ok(InterfaceInfo {
            name: name.to_string(),
            operstate,
            mac,
            mtu,
            addresses,
        })
    }

    /// Addresses come from `ip -j addr`; an unavailable `ip` yields none
    async fn addresses(&self, name: &str) -> Vec<String> {
        let argv = ["ip", "-j", "addr", "show", "dev", name];
        match system::run(&argv, self.command_timeout).await {
            Ok(output) if output.success() => parse_ip_json(&output.stdout),
            Ok(output) => {
                debug!(interface = %name, stderr = %output.stderr.trim(), "ip addr failed");
                Vec::new()
            }
            Err(e) => {
                warn!(interface = %name, "Failed to query addresses: {}", e);
                Vec::new()
            }
        }
    }

    async fn probe(&self, target: &str) -> Result<ProbeResult, GatewayError> {
        let (host, port) = parse_host_port(target)?;
        let started = Instant::now();

        match tokio::time::timeout(self.probe_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_stream)) => Ok(ProbeResult {
                host,
                port,
                reachable: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            }),
            Ok(Err(e)) => {
                debug!(host = %host, port, "Probe failed: {}", e);
                Ok(ProbeResult {
                    host,
                    port,
                    reachable: false,
                    latency_ms: None,
                })
            }
            Err(_) => {
                debug!(host = %host, port, "Probe timed out");
                Err(GatewayError::Timeout)
            }
        }
    }
}

#[async_trait]
impl OperationFamily for NetworkFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Network
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "hostname" => {
                let hostname = nix::unistd::gethostname()
                    .map(|h| h.to_string_lossy().into_owned())
                    .map_err(|e| {
                        warn!("gethostname failed: {}", e);
                        GatewayError::Internal
                    })?;
                json_reply(serde_json::json!({ "hostname": hostname }))
            }
            "ifnames" => {
                let ifnames = list_interfaces(&self.sys_net).await;
                json_reply(serde_json::json!({ "ifnames": ifnames }))
            }
            "ifconfig" => json_reply(self.interface(ctx.require_arg()?).await?),
            "nameservers" => {
                let text = tokio::fs::read_to_string(&self.resolv_conf).await.unwrap_or_default();
                json_reply(serde_json::json!({ "nameservers": parse_nameservers(&text) }))
            }
            "gateway" => {
                let text = tokio::fs::read_to_string(&self.route_table).await.unwrap_or_default();
                json_reply(serde_json::json!({ "gateway": parse_default_route(&text) }))
            }
            "probe" => json_reply(self.probe(ctx.require_arg()?).await?),
            other => Err(GatewayError::UnsupportedOperation(format!("network/{}", other))),
        }
    }
}

// ===== Parsers =====

/// Interface names under a `/sys/class/net`-style directory, sorted
async fn list_interfaces(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    names
}

fn parse_nameservers(resolv_conf: &str) -> Vec<String> {
    resolv_conf
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with(';'))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Default route from `/proc/net/route` (addresses are little-endian hex)
fn parse_default_route(table: &str) -> Option<DefaultRoute> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        Some(DefaultRoute {
            interface: fields[0].to_string(),
            gateway: Ipv4Addr::from(raw.to_le_bytes()).to_string(),
        })
    })
}

/// `host:port`, with `[v6]:port` for IPv6 literals
fn parse_host_port(target: &str) -> Result<(String, u16), GatewayError> {
    let invalid = || GatewayError::BadRequest(format!("Expected host:port, got '{}'", target));

    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn parse_ip_json(stdout: &str) -> Vec<String> {
    let Ok(links) = serde_json::from_str::<Vec<serde_json::Value>>(stdout) else {
        return Vec::new();
    };

    links
        .iter()
        .filter_map(|link| link.get("addr_info").and_then(|a| a.as_array()))
        .flatten()
        .filter_map(|info| {
            let local = info.get("local")?.as_str()?;
            let prefix = info.get("prefixlen")?.as_u64()?;
            Some(format!("{}/{}", local, prefix))
        })
        .collect()
}
