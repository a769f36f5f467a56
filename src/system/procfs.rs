//! Process records from `/proc`
//!
//! Records are read fresh on every call; nothing here caches process state.

use nix::unistd::{Uid, User};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const PROC_ROOT: &str = "/proc";

/// Coarse process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
    Unknown,
}

impl ProcessState {
    fn from_code(code: char) -> Self {
        match code {
            'R' | 'S' | 'D' | 'I' | 'W' | 'P' | 'K' => ProcessState::Running,
            'T' | 't' => ProcessState::Stopped,
            _ => ProcessState::Unknown,
        }
    }
}

/// A live process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub name: String,
    pub state: ProcessState,
    pub owner: String,
    pub uid: u32,
    #[serde(skip)]
    state_code: char,
}

impl ProcessRecord {
    /// Zombies and dead entries have exited already
    pub fn is_alive(&self) -> bool {
        !matches!(self.state_code, 'Z' | 'X' | 'x')
    }
}

/// Read one process, `None` if it does not exist (or vanished mid-read)
pub async fn read_process(pid: i32) -> Option<ProcessRecord> {
    read_process_in(Path::new(PROC_ROOT), pid).await
}

/// Every process currently visible in `/proc`, ordered by pid
pub async fn list_processes() -> Vec<ProcessRecord> {
    list_processes_in(Path::new(PROC_ROOT)).await
}

/// Processes whose name equals `name`
pub async fn find_by_name(name: &str) -> Vec<ProcessRecord> {
    list_processes()
        .await
        .into_iter()
        .filter(|p| p.name == name && p.is_alive())
        .collect()
}

/// Whether `pid` exists and has not exited
pub async fn is_alive(pid: i32) -> bool {
    read_process(pid).await.is_some_and(|p| p.is_alive())
}

async fn read_process_in(root: &Path, pid: i32) -> Option<ProcessRecord> {
    if pid <= 0 {
        return None;
    }

    let dir: PathBuf = root.join(pid.to_string());
    let stat = tokio::fs::read_to_string(dir.join("stat")).await.ok()?;
    let status = tokio::fs::read_to_string(dir.join("status")).await.ok()?;

    let (name, state_code) = parse_stat(&stat)?;
    let uid = parse_uid(&status).unwrap_or(u32::MAX);

    Some(ProcessRecord {
        pid,
        name,
        state: ProcessState::from_code(state_code),
        owner: owner_name(uid),
        uid,
        state_code,
    })
}

async fn list_processes_in(root: &Path) -> Vec<ProcessRecord> {
    let mut pids = Vec::new();

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read {}: {}", root.display(), e);
            return Vec::new();
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();

    let mut records = Vec::with_capacity(pids.len());
    for pid in pids {
        if let Some(record) = read_process_in(root, pid).await {
            records.push(record);
        }
    }
    records
}

/// `pid (comm) S ...`; comm may itself contain parentheses
fn parse_stat(stat: &str) -> Option<(String, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = stat[open + 1..close].to_string();
    let state = stat[close + 1..].trim_start().chars().next()?;
    Some((name, state))
}

fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}
