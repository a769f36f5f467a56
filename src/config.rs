//! Configuration management
//!
//! `GatewayConfig` is built once at startup and shared by `Arc` with every
//! component that needs it. Runtime-editable settings (listen address, TLS
//! paths, credentials) live in the persisted [`crate::store::ConfigStore`]
//! instead.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory for the config document, PID file and TLS material
    pub data_dir: PathBuf,

    /// Persisted settings document
    pub config_file: PathBuf,

    /// PID marker file
    pub pid_file: PathBuf,

    /// Package repository definitions (`*.repo`)
    pub repo_dir: PathBuf,

    /// Root for file preview/download/upload paths
    pub file_root: PathBuf,

    /// Static files of installed UI plugins, served under `/api/plugins`
    pub plugin_dir: PathBuf,

    /// Timeout for network probes (connect checks, NTP queries)
    pub probe_timeout: Duration,

    /// Enable request logging
    pub log_requests: bool,

    /// Debug mode (verbose logging)
    pub debug: bool,

    /// Session and login settings
    pub auth: AuthConfig,

    /// Process control policy
    pub process: ProcessPolicy,
}

/// Session and login settings
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Session lifetime
    pub session_ttl: Duration,
    /// Destroy other sessions of a user on login
    pub single_session: bool,
    /// Mark cookies `Secure` (HTTPS only)
    pub secure_cookies: bool,
    /// Max login attempts per window per client address
    pub max_login_attempts: u32,
    /// Login rate-limit window
    pub login_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(86400),
            single_session: false,
            secure_cookies: false,
            max_login_attempts: 5,
            login_window: Duration::from_secs(60),
        }
    }
}

/// A program the gateway may start, stop and restart
#[derive(Debug, Clone, Serialize)]
pub struct ManagedProgram {
    /// Name used in `/api/process/start/{name}`
    pub name: String,
    /// Process name as reported by the kernel (`comm`)
    pub process_name: String,
    /// Command that starts the program; must return once the program is up
    pub start: Vec<String>,
    /// At most one instance may run
    pub singleton: bool,
}

impl ManagedProgram {
    /// A systemd-managed service whose unit and process share a name
    pub fn systemd(name: &str) -> Self {
        Self {
            name: name.to_string(),
            process_name: name.to_string(),
            start: vec!["systemctl".to_string(), "start".to_string(), name.to_string()],
            singleton: true,
        }
    }
}

/// Which processes may be targeted, and how long commands may take
#[derive(Debug, Clone)]
pub struct ProcessPolicy {
    /// Managed programs (the allow-list)
    pub programs: Vec<ManagedProgram>,
    /// Also allow processes owned by the gateway's effective user
    pub allow_own_processes: bool,
    /// Timeout for start commands
    pub command_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
}

impl Default for ProcessPolicy {
    fn default() -> Self {
        Self {
            programs: ["nginx", "httpd", "mysqld", "php-fpm", "redis-server", "memcached"]
                .iter()
                .map(|name| ManagedProgram::systemd(name))
                .collect(),
            allow_own_processes: false,
            command_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessPolicy {
    /// Look up a managed program by name
    pub fn program(&self, name: &str) -> Option<&ManagedProgram> {
        self.programs.iter().find(|p| p.name == name)
    }

    /// Look up the managed program a running process belongs to
    pub fn program_for_process(&self, process_name: &str) -> Option<&ManagedProgram> {
        self.programs.iter().find(|p| p.process_name == process_name)
    }
}

impl GatewayConfig {
    /// Configuration rooted at `data_dir` with defaults for everything else
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();

        Self {
            config_file: data_dir.join("config.toml"),
            pid_file: data_dir.join("hostgate.pid"),
            plugin_dir: data_dir.join("plugins"),
            data_dir,
            repo_dir: PathBuf::from("/etc/yum.repos.d"),
            file_root: PathBuf::from("/"),
            probe_timeout: Duration::from_secs(5),
            log_requests: true,
            debug: false,
            auth: AuthConfig::default(),
            process: ProcessPolicy::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("HOSTGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("hostgate")
            });

        let mut config = Self::with_data_dir(data_dir);

        if let Ok(path) = std::env::var("HOSTGATE_CONFIG") {
            config.config_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_PID_FILE") {
            config.pid_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_REPO_DIR") {
            config.repo_dir = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_FILE_ROOT") {
            config.file_root = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("HOSTGATE_PLUGIN_DIR") {
            config.plugin_dir = PathBuf::from(path);
        }

        if let Some(secs) = env_u64("HOSTGATE_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = Duration::from_secs(secs);
        }

        config.log_requests = env_flag("HOSTGATE_LOG_REQUESTS").unwrap_or(true);
        config.debug = env_flag("HOSTGATE_DEBUG").unwrap_or(false);

        if let Some(secs) = env_u64("HOSTGATE_SESSION_TTL_SECS") {
            config.auth.session_ttl = Duration::from_secs(secs);
        }
        config.auth.single_session = env_flag("HOSTGATE_SINGLE_SESSION").unwrap_or(false);
        config.auth.secure_cookies = env_flag("HOSTGATE_SECURE_COOKIES").unwrap_or(false);

        if let Ok(names) = std::env::var("HOSTGATE_PROGRAMS") {
            config.process.programs = names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(ManagedProgram::systemd)
                .collect();
        }
        config.process.allow_own_processes =
            env_flag("HOSTGATE_ALLOW_OWN_PROCESSES").unwrap_or(false);
        if let Some(secs) = env_u64("HOSTGATE_COMMAND_TIMEOUT_SECS") {
            config.process.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HOSTGATE_STOP_TIMEOUT_SECS") {
            config.process.stop_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Directory holding the TLS pair by default
    pub fn ssl_dir(&self) -> PathBuf {
        self.data_dir.join("ssl")
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
