//! PID marker file
//!
//! Written once at startup, removed when the guard is dropped on clean
//! shutdown.

use crate::atomic;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Owns the PID file for the lifetime of the server
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Record the current process id at `path`
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::create_with_pid(path, std::process::id()).await
    }

    async fn create_with_pid(path: impl Into<PathBuf>, pid: u32) -> io::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(previous) = read_pid(&path).await {
            if previous != pid && crate::system::procfs::is_alive(previous as i32).await {
                warn!(
                    pid = previous,
                    file = %path.display(),
                    "PID file names a running process, overwriting"
                );
            }
        }

        atomic::replace_file(&path, format!("{}\n", pid).as_bytes(), Some(0o600)).await?;
        info!(pid, file = %path.display(), "PID file written");

        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Leave the file alone if another instance took it over
        let owned = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if !owned {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(file = %self.path.display(), error = %error, "Failed to remove PID file");
            }
            _ => {}
        }
    }
}

/// Pid recorded in `path`, if any
pub async fn read_pid(path: &Path) -> Option<u32> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
