//! Batch status queries
//!
//! `/api/query/server.hostname,server.uptime` returns one object keyed by
//! item name. Items that are unknown or cannot be read come back as `null`.

use super::json_reply;
use crate::error::GatewayError;
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::debug;

const COMMANDS: &[CommandSpec] = &[CommandSpec::read("items")];

/// Upper bound on items per request
const MAX_ITEMS: usize = 32;

pub struct QueryFamily {
    proc_root: PathBuf,
    os_release: PathBuf,
}

impl Default for QueryFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryFamily {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }

    async fn read_proc(&self, name: &str) -> Option<String> {
        tokio::fs::read_to_string(self.proc_root.join(name)).await.ok()
    }

    async fn item(&self, name: &str) -> Value {
        match name {
            "server.hostname" => nix::unistd::gethostname()
                .ok()
                .map(|h| Value::String(h.to_string_lossy().into_owned()))
                .unwrap_or(Value::Null),
            "server.uptime" => self
                .read_proc("uptime")
                .await
                .and_then(|text| parse_uptime(&text))
                .map(|secs| json!({ "seconds": secs }))
                .unwrap_or(Value::Null),
            "server.loadavg" => self
                .read_proc("loadavg")
                .await
                .and_then(|text| parse_loadavg(&text))
                .map(|[one, five, fifteen]| json!([one, five, fifteen]))
                .unwrap_or(Value::Null),
            "server.meminfo" => self
                .read_proc("meminfo")
                .await
                .map(|text| Value::Object(parse_meminfo(&text)))
                .unwrap_or(Value::Null),
            "server.cpus" => {
                let cpuinfo = self.read_proc("cpuinfo").await.unwrap_or_default();
                let (count, model) = parse_cpuinfo(&cpuinfo);
                let count = if count > 0 {
                    count
                } else {
                    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
                };
                json!({ "count": count, "model": model })
            }
            "server.datetime" => Value::String(Local::now().to_rfc3339()),
            "server.os" => {
                let release = tokio::fs::read_to_string(&self.os_release).await.unwrap_or_default();
                let kernel = self
                    .read_proc("sys/kernel/osrelease")
                    .await
                    .map(|k| k.trim().to_string());
                json!({ "name": parse_os_name(&release), "kernel": kernel })
            }
            "service.version" => Value::String(env!("CARGO_PKG_VERSION").to_string()),
            other => {
                debug!(item = %other, "Unknown query item");
                Value::Null
            }
        }
    }
}

#[async_trait]
impl OperationFamily for QueryFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Query
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let items: Vec<&str> = ctx
            .require_arg()?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if items.len() > MAX_ITEMS {
            return Err(GatewayError::BadRequest(format!(
                "At most {} items per query",
                MAX_ITEMS
            )));
        }

        let mut result = Map::new();
        for item in items {
            let value = self.item(item).await;
            result.insert(item.to_string(), value);
        }
        json_reply(result)
    }
}

fn parse_uptime(text: &str) -> Option<u64> {
    text.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs as u64)
}

fn parse_loadavg(text: &str) -> Option<[f64; 3]> {
    let mut fields = text.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

/// Selected `/proc/meminfo` fields, converted to bytes
fn parse_meminfo(text: &str) -> Map<String, Value> {
    const FIELDS: &[(&str, &str)] = &[
        ("MemTotal", "total"),
        ("MemFree", "free"),
        ("MemAvailable", "available"),
        ("Buffers", "buffers"),
        ("Cached", "cached"),
        ("SwapTotal", "swap_total"),
        ("SwapFree", "swap_free"),
    ];

    let mut out = Map::new();
    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let Some((_, label)) = FIELDS.iter().find(|(field, _)| *field == name) else {
            continue;
        };
        if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
            out.insert(label.to_string(), json!(kb * 1024));
        }
    }
    out
}

fn parse_cpuinfo(text: &str) -> (usize, Option<String>) {
    let count = text.lines().filter(|l| l.starts_with("processor")).count();
    let model = text
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, m)| m.trim().to_string());
    (count, model)
}

fn parse_os_name(os_release: &str) -> Option<String> {
    let lookup = |key: &str| {
        os_release.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_string())
        })
    };
    lookup("PRETTY_NAME").or_else(|| lookup("NAME"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router::PatternRouter;
    use axum::http::Method;
    use tempfile::TempDir;

    fn fake_host() -> (TempDir, QueryFamily) {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        std::fs::create_dir_all(proc_root.join("sys/kernel")).unwrap();
        std::fs::write(proc_root.join("uptime"), "12345.67 54321.00\n").unwrap();
        std::fs::write(proc_root.join("loadavg"), "0.50 0.25 0.10 1/123 4567\n").unwrap();
        std::fs::write(
            proc_root.join("meminfo"),
            "MemTotal:        2048 kB\nMemFree:         1024 kB\nHugePages_Total:       0\n",
        )
        .unwrap();
        std::fs::write(
            proc_root.join("cpuinfo"),
            "processor\t: 0\nmodel name\t: Test CPU\n\nprocessor\t: 1\nmodel name\t: Test CPU\n",
        )
        .unwrap();
        std::fs::write(proc_root.join("sys/kernel/osrelease"), "6.1.0-test\n").unwrap();
        std::fs::write(dir.path().join("os-release"), "NAME=\"Rocky\"\nPRETTY_NAME=\"Rocky Linux 9\"\n").unwrap();

        let family = QueryFamily {
            proc_root,
            os_release: dir.path().join("os-release"),
        };
        (dir, family)
    }

    async fn query(family: &QueryFamily, items: &str) -> Value {
        let router = PatternRouter::with_default_routes().unwrap();
        let m = router.resolve(&format!("/api/query/{}", items)).unwrap();
        let ctx = RequestContext::from_match(&m, Method::GET);
        match family.execute(ctx).await.unwrap() {
            Reply::Json(v) => v,
            other => panic!("expected JSON reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_items() {
        let (_dir, family) = fake_host();
        let body = query(&family, "server.uptime,server.loadavg,server.meminfo,server.cpus,server.os").await;

        assert_eq!(body["server.uptime"]["seconds"], 12345);
        assert_eq!(body["server.loadavg"], json!([0.5, 0.25, 0.1]));
        assert_eq!(body["server.meminfo"]["total"], 2048 * 1024);
        assert_eq!(body["server.cpus"]["count"], 2);
        assert_eq!(body["server.cpus"]["model"], "Test CPU");
        assert_eq!(body["server.os"]["name"], "Rocky Linux 9");
        assert_eq!(body["server.os"]["kernel"], "6.1.0-test");
    }

    #[tokio::test]
    async fn test_unknown_item_is_null() {
        let (_dir, family) = fake_host();
        let body = query(&family, "server.nope,service.version").await;

        assert!(body["server.nope"].is_null());
        assert_eq!(body["service.version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_parsers_tolerate_garbage() {
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_loadavg("0.1 x"), None);
        assert!(parse_meminfo("garbage").is_empty());
        assert_eq!(parse_os_name("ID=rocky"), None);
    }
}
