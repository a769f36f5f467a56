//! Process control
//!
//! `list`, `query`, `start`, `stop`, `restart`, `kill`.
//!
//! Targets are either a pid or a managed program name. A pid may be touched
//! only if its process belongs to a managed program or, when
//! `allow_own_processes` is set, runs as the gateway's effective user. Pid 1
//! and the gateway itself are never targets.
//!
//! `stop` and `kill` succeed with `noop: true` when the target is already
//! gone. `restart` stops every instance, waits until they have exited, then
//! runs the start command. Start, stop by name and restart of one program
//! are serialized so a singleton check cannot race another start.

use super::json_reply;
use crate::config::{ManagedProgram, ProcessPolicy};
use crate::error::{GatewayError, ProcessError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use crate::system::{self, procfs, CommandError, ProcessRecord};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("list"),
    CommandSpec::read("query"),
    CommandSpec::write("start"),
    CommandSpec::write("stop"),
    CommandSpec::write("restart"),
    CommandSpec::write("kill"),
];

/// Interval between liveness checks while waiting for exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for exit after SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

enum Target {
    Pid(i32),
    Name(String),
}

impl Target {
    fn parse(arg: &str) -> Result<Self, GatewayError> {
        if arg.chars().all(|c| c.is_ascii_digit()) {
            let pid = arg
                .parse::<i32>()
                .map_err(|_| GatewayError::BadRequest(format!("Invalid pid '{}'", arg)))?;
            Ok(Target::Pid(pid))
        } else {
            Ok(Target::Name(arg.to_string()))
        }
    }
}

pub struct ProcessFamily {
    policy: ProcessPolicy,
    self_pid: i32,
    euid: u32,
    program_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProcessFamily {
    pub fn new(policy: ProcessPolicy) -> Self {
        Self {
            policy,
            self_pid: std::process::id() as i32,
            euid: nix::unistd::geteuid().as_raw(),
            program_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock held across any check-then-act sequence on one program
    fn program_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.program_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn is_targetable(&self, record: &ProcessRecord) -> bool {
        if record.pid <= 1 || record.pid == self.self_pid {
            return false;
        }
        self.policy.program_for_process(&record.name).is_some()
            || (self.policy.allow_own_processes && record.uid == self.euid)
    }

    fn program(&self, name: &str) -> Result<&ManagedProgram, ProcessError> {
        self.policy
            .program(name)
            .or_else(|| self.policy.program_for_process(name))
            .ok_or(ProcessError::Forbidden)
    }

    async fn list(&self) -> Result<Reply, GatewayError> {
        let processes = procfs::list_processes().await;
        let programs: Vec<_> = self
            .policy
            .programs
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "process_name": p.process_name,
                    "running": processes.iter().any(|r| r.name == p.process_name && r.is_alive()),
                })
            })
            .collect();

        json_reply(json!({ "processes": processes, "programs": programs }))
    }

    async fn query(&self, arg: &str) -> Result<Reply, GatewayError> {
        let records = match Target::parse(arg)? {
            Target::Pid(pid) => procfs::read_process(pid).await.into_iter().collect(),
            Target::Name(name) => procfs::find_by_name(&name).await,
        };

        if records.is_empty() {
            return Err(ProcessError::NotFound.into());
        }
        json_reply(json!({ "processes": records }))
    }

    async fn stop(&self, arg: &str) -> Result<Reply, GatewayError> {
        match Target::parse(arg)? {
            Target::Pid(pid) => {
                if pid <= 1 {
                    return Err(ProcessError::Forbidden.into());
                }
                let record = match procfs::read_process(pid).await {
                    Some(record) if record.is_alive() => record,
                    _ => return json_reply(json!({ "ok": true, "noop": true, "pid": pid })),
                };
                if !self.is_targetable(&record) {
                    warn!(pid, name = %record.name, "Refusing to stop untargetable process");
                    return Err(ProcessError::Forbidden.into());
                }

                let noop = !self.terminate(pid).await?;
                json_reply(json!({ "ok": true, "noop": noop, "pid": pid }))
            }
            Target::Name(name) => {
                let program = self.program(&name)?.clone();
                let lock = self.program_lock(&program.name);
                let _guard = lock.lock().await;
                let stopped = self.stop_program(&program).await?;
                json_reply(json!({
                    "ok": true,
                    "noop": stopped.is_empty(),
                    "program": program.name,
                    "stopped": stopped,
                }))
            }
        }
    }

    async fn kill(&self, ctx: &RequestContext, arg: &str) -> Result<Reply, GatewayError> {
        let pid = match Target::parse(arg)? {
            Target::Pid(pid) => pid,
            Target::Name(_) => {
                return Err(GatewayError::BadRequest("kill requires a pid".to_string()));
            }
        };
        let signal = match ctx.field("signal") {
            Some(raw) => parse_signal(&raw)?,
            None => Signal::SIGKILL,
        };

        if pid <= 1 {
            return Err(ProcessError::Forbidden.into());
        }
        let record = match procfs::read_process(pid).await {
            Some(record) if record.is_alive() => record,
            _ => return json_reply(json!({ "ok": true, "noop": true, "pid": pid })),
        };
        if !self.is_targetable(&record) {
            warn!(pid, name = %record.name, "Refusing to signal untargetable process");
            return Err(ProcessError::Forbidden.into());
        }

        let delivered = send_signal(pid, signal)?;
        info!(pid, signal = %signal, "Signalled process");
        json_reply(json!({
            "ok": true,
            "noop": !delivered,
            "pid": pid,
            "signal": signal.as_str(),
        }))
    }

    async fn start(&self, name: &str) -> Result<Reply, GatewayError> {
        let program = self.program(name)?.clone();
        let lock = self.program_lock(&program.name);
        let _guard = lock.lock().await;

        if program.singleton && !procfs::find_by_name(&program.process_name).await.is_empty() {
            return Err(ProcessError::AlreadyRunning.into());
        }

        self.run_start(&program).await?;
        let pids: Vec<i32> = procfs::find_by_name(&program.process_name)
            .await
            .iter()
            .map(|r| r.pid)
            .collect();

        json_reply(json!({ "ok": true, "program": program.name, "pids": pids }))
    }

    async fn restart(&self, arg: &str) -> Result<Reply, GatewayError> {
        let program = match Target::parse(arg)? {
            Target::Pid(pid) => {
                // A pid that is gone cannot be attributed to a program
                let record = procfs::read_process(pid)
                    .await
                    .filter(|r| r.is_alive())
                    .ok_or(ProcessError::Forbidden)?;
                if !self.is_targetable(&record) {
                    warn!(pid, name = %record.name, "Refusing to restart untargetable process");
                    return Err(ProcessError::Forbidden.into());
                }
                self.policy
                    .program_for_process(&record.name)
                    .cloned()
                    .ok_or(ProcessError::Forbidden)?
            }
            Target::Name(name) => self.program(&name)?.clone(),
        };

        let lock = self.program_lock(&program.name);
        let _guard = lock.lock().await;
        let stopped = self.stop_program(&program).await?;
        self.run_start(&program).await?;

        let pids: Vec<i32> = procfs::find_by_name(&program.process_name)
            .await
            .iter()
            .map(|r| r.pid)
            .collect();

        info!(program = %program.name, "Restarted program");
        json_reply(json!({
            "ok": true,
            "program": program.name,
            "stopped": stopped,
            "pids": pids,
        }))
    }

    /// Stop every running instance of a program; returns the stopped pids
    async fn stop_program(&self, program: &ManagedProgram) -> Result<Vec<i32>, GatewayError> {
        let mut stopped = Vec::new();
        for record in procfs::find_by_name(&program.process_name).await {
            if !self.is_targetable(&record) {
                continue;
            }
            if self.terminate(record.pid).await? {
                stopped.push(record.pid);
            }
        }
        Ok(stopped)
    }

    /// SIGTERM, wait, then SIGKILL. Returns false if the process was
    /// already gone.
    async fn terminate(&self, pid: i32) -> Result<bool, ProcessError> {
        if !send_signal(pid, Signal::SIGTERM)? {
            return Ok(false);
        }
        info!(pid, "Sent SIGTERM");

        if wait_for_exit(pid, self.policy.stop_timeout).await {
            return Ok(true);
        }

        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        send_signal(pid, Signal::SIGKILL)?;

        if wait_for_exit(pid, KILL_GRACE).await {
            Ok(true)
        } else {
            warn!(pid, "Process survived SIGKILL");
            Err(ProcessError::Timeout)
        }
    }

    async fn run_start(&self, program: &ManagedProgram) -> Result<(), ProcessError> {
        info!(program = %program.name, command = ?program.start, "Starting program");

        let output = system::run(&program.start, self.policy.command_timeout)
            .await
            .map_err(|e| match e {
                CommandError::Timeout { .. } => ProcessError::Timeout,
                other => {
                    warn!(program = %program.name, "Start command failed: {}", other);
                    ProcessError::Failed
                }
            })?;

        if !output.success() {
            warn!(
                program = %program.name,
                code = ?output.code,
                stderr = %output.stderr.trim(),
                "Start command exited unsuccessfully"
            );
            return Err(ProcessError::Failed);
        }
        Ok(())
    }
}

#[async_trait]
impl OperationFamily for ProcessFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Process
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "list" => self.list().await,
            "query" => self.query(ctx.require_arg()?).await,
            "start" => self.start(ctx.require_arg()?).await,
            "stop" => self.stop(ctx.require_arg()?).await,
            "restart" => self.restart(ctx.require_arg()?).await,
            "kill" => self.kill(&ctx, ctx.require_arg()?).await,
            other => Err(GatewayError::UnsupportedOperation(format!("process/{}", other))),
        }
    }
}

/// Deliver a signal; returns false if the process no longer exists
fn send_signal(pid: i32, signal: Signal) -> Result<bool, ProcessError> {
    match signal::kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Err(ProcessError::Forbidden),
        Err(e) => {
            warn!(pid, "Failed to signal process: {}", e);
            Err(ProcessError::Failed)
        }
    }
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !procfs::is_alive(pid).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// `SIGTERM`, `TERM` or `15`
fn parse_signal(raw: &str) -> Result<Signal, GatewayError> {
    let raw = raw.trim();
    let invalid = || GatewayError::BadRequest(format!("Unknown signal '{}'", raw));

    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| invalid());
    }

    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|_| invalid())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::gateway::router::PatternRouter;
    use axum::http::Method;

    fn family(allow_own: bool) -> ProcessFamily {
        let policy = ProcessPolicy {
            allow_own_processes: allow_own,
            stop_timeout: Duration::from_secs(2),
            ..ProcessPolicy::default()
        };
        ProcessFamily::new(policy)
    }

    fn ctx(path: &str) -> RequestContext {
        let router = PatternRouter::with_default_routes().unwrap();
        let m = router.resolve(path).unwrap();
        RequestContext::from_match(&m, Method::POST)
    }

    fn json_of(reply: Reply) -> serde_json::Value {
        match reply {
            Reply::Json(v) => v,
            other => panic!("expected JSON reply, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_for_exited_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.kill().await.unwrap();

        let family = family(true);
        for _ in 0..2 {
            let reply = family.execute(ctx(&format!("/api/process/stop/{}", pid))).await.unwrap();
            let body = json_of(reply);
            assert_eq!(body["ok"], true);
            assert_eq!(body["noop"], true);
        }
    }

    #[tokio::test]
    async fn test_stop_running_own_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;

        let family = family(true);
        let body = json_of(family.execute(ctx(&format!("/api/process/stop/{}", pid))).await.unwrap());
        assert_eq!(body["noop"], false);
        assert!(!procfs::is_alive(pid).await);

        // Reap; the second stop sees nothing left to do
        child.wait().await.unwrap();
        let body = json_of(family.execute(ctx(&format!("/api/process/stop/{}", pid))).await.unwrap());
        assert_eq!(body["noop"], true);
    }

    #[tokio::test]
    async fn test_unlisted_process_is_forbidden() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;

        let family = family(false);
        let err = family
            .execute(ctx(&format!("/api/process/kill/{}", pid)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Forbidden");
        assert!(procfs::is_alive(pid).await);

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_and_self_are_never_targets() {
        let family = family(true);

        let err = family.execute(ctx("/api/process/stop/1")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Forbidden");

        let own = std::process::id();
        let err = family
            .execute(ctx(&format!("/api/process/kill/{}", own)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Forbidden");
    }

    #[tokio::test]
    async fn test_restart_missing_pid_is_forbidden() {
        let family = family(false);
        let err = family.execute(ctx("/api/process/restart/999999")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Forbidden");
    }

    #[tokio::test]
    async fn test_start_unmanaged_program_is_forbidden() {
        let family = family(false);
        let err = family.execute(ctx("/api/process/start/bash")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Forbidden");
    }

    #[tokio::test]
    async fn test_start_singleton_already_running() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();

        let mut policy = ProcessPolicy::default();
        policy.programs = vec![ManagedProgram {
            name: "sleeper".to_string(),
            process_name: "sleep".to_string(),
            start: vec!["true".to_string()],
            singleton: true,
        }];
        let family = ProcessFamily::new(policy);

        let err = family.execute(ctx("/api/process/start/sleeper")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.AlreadyRunning");

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_singleton_starts_launch_once() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("hg-singleton");
        let sleep = ["/bin/sleep", "/usr/bin/sleep"]
            .into_iter()
            .find(|p| std::path::Path::new(p).exists())
            .unwrap();
        std::fs::copy(sleep, &binary).unwrap();

        // The start command returns once the program is up
        let launch = format!("'{}' 30 >/dev/null 2>&1 & sleep 0.3", binary.display());
        let mut policy = ProcessPolicy::default();
        policy.programs = vec![ManagedProgram {
            name: "singleton".to_string(),
            process_name: "hg-singleton".to_string(),
            start: vec!["sh".to_string(), "-c".to_string(), launch],
            singleton: true,
        }];
        let family = ProcessFamily::new(policy);

        let (first, second) = tokio::join!(
            family.execute(ctx("/api/process/start/singleton")),
            family.execute(ctx("/api/process/start/singleton")),
        );
        let running = procfs::find_by_name("hg-singleton").await;
        for record in &running {
            send_signal(record.pid, Signal::SIGKILL).unwrap();
        }

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(err.kind(), "ProcessError.AlreadyRunning");
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_start_command_failure() {
        let mut policy = ProcessPolicy::default();
        policy.programs = vec![ManagedProgram {
            name: "broken".to_string(),
            process_name: "hostgate-no-such-process".to_string(),
            start: vec!["false".to_string()],
            singleton: true,
        }];
        let family = ProcessFamily::new(policy);

        let err = family.execute(ctx("/api/process/start/broken")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.Failed");
    }

    #[tokio::test]
    async fn test_query_missing_is_not_found() {
        let family = family(false);
        let err = family.execute(ctx("/api/process/query/999999")).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError.NotFound");
    }

    #[tokio::test]
    async fn test_list_includes_self() {
        let family = family(false);
        let body = json_of(family.execute(ctx("/api/process/list")).await.unwrap());
        let own = std::process::id() as i64;

        assert!(body["processes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p["pid"].as_i64() == Some(own)));
        assert!(body["programs"].is_array());
    }
}
