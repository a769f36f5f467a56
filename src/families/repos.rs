//! Yum repository definitions
//!
//! Repositories are INI sections in `*.repo` files under the repository
//! directory. A new repository gets its own `<id>.repo`; edits rewrite the
//! file that holds the section. Comments in rewritten files are not kept.

use super::json_reply;
use crate::atomic;
use crate::error::{ConfigError, GatewayError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("list"),
    CommandSpec::read("item"),
    CommandSpec::write("add"),
    CommandSpec::write("update"),
    CommandSpec::write("delete"),
    CommandSpec::write("enable"),
    CommandSpec::write("disable"),
];

static REPO_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$").unwrap());

/// Keys settable through `add` and `update`
const EDITABLE_KEYS: &[&str] = &["name", "baseurl", "mirrorlist", "enabled", "gpgcheck", "gpgkey"];

/// One `[id]` section
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repository {
    pub id: String,
    /// File the section lives in, relative to the repository directory
    pub file: String,
    pub enabled: bool,
    pub options: BTreeMap<String, String>,
}

/// Parsed `.repo` file, sections and keys in file order
#[derive(Debug, Clone, Default, PartialEq)]
struct RepoFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl RepoFile {
    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut file = RepoFile::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(id) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                file.sections.push((id.trim().to_string(), Vec::new()));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!("Malformed repository line {}", lineno + 1))
            })?;
            let (_, options) = file.sections.last_mut().ok_or_else(|| {
                ConfigError::Invalid(format!("Option outside a section on line {}", lineno + 1))
            })?;
            options.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(file)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (i, (id, options)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", id));
            for (key, value) in options {
                out.push_str(&format!("{}={}\n", key, value));
            }
        }
        out
    }

    fn section_mut(&mut self, id: &str) -> Option<&mut Vec<(String, String)>> {
        self.sections
            .iter_mut()
            .find(|(sid, _)| sid == id)
            .map(|(_, options)| options)
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|(sid, _)| sid != id);
        self.sections.len() != before
    }
}

fn set_option(options: &mut Vec<(String, String)>, key: &str, value: &str) {
    match options.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value.to_string(),
        None => options.push((key.to_string(), value.to_string())),
    }
}

fn is_enabled(options: &[(String, String)]) -> bool {
    // yum treats a missing `enabled` as enabled
    options
        .iter()
        .find(|(k, _)| k == "enabled")
        .map(|(_, v)| parse_flag(v).unwrap_or(false))
        .unwrap_or(true)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub struct RepositoryFamily {
    repo_dir: PathBuf,
    writer: Mutex<()>,
}

impl RepositoryFamily {
    pub fn new(repo_dir: PathBuf) -> Self {
        Self {
            repo_dir,
            writer: Mutex::new(()),
        }
    }

    /// Every `.repo` file, sorted by name
    async fn repo_files(&self) -> Result<Vec<(String, RepoFile)>, ConfigError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.repo_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                warn!("Failed to read {}: {}", self.repo_dir.display(), e);
                return Err(ConfigError::IoFailure);
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".repo") && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = self.repo_dir.join(&name);
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                warn!("Failed to read {}: {}", path.display(), e);
                ConfigError::IoFailure
            })?;
            match RepoFile::parse(&text) {
                Ok(file) => files.push((name, file)),
                Err(e) => warn!("Skipping malformed {}: {}", path.display(), e),
            }
        }
        Ok(files)
    }

    async fn list(&self) -> Result<Vec<Repository>, ConfigError> {
        let mut repos = Vec::new();
        for (name, file) in self.repo_files().await? {
            for (id, options) in &file.sections {
                repos.push(Repository {
                    id: id.clone(),
                    file: name.clone(),
                    enabled: is_enabled(options),
                    options: options.iter().cloned().collect(),
                });
            }
        }
        Ok(repos)
    }

    async fn find(&self, id: &str) -> Result<Repository, ConfigError> {
        self.list()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ConfigError::NotFound(format!("Repository {}", id)))
    }

    async fn write(&self, name: &str, file: &RepoFile) -> Result<(), ConfigError> {
        let path = self.repo_dir.join(name);
        if file.sections.is_empty() {
            return tokio::fs::remove_file(&path).await.map_err(|e| {
                warn!("Failed to remove {}: {}", path.display(), e);
                ConfigError::IoFailure
            });
        }

        atomic::replace_file(&path, file.render().as_bytes(), Some(0o644))
            .await
            .map_err(|e| {
                warn!("Failed to write {}: {}", path.display(), e);
                ConfigError::IoFailure
            })
    }

    /// Load the file holding `id`, let `edit` change it, write it back
    async fn edit<F>(&self, id: &str, edit: F) -> Result<Repository, ConfigError>
    where
        F: FnOnce(&mut RepoFile) -> Result<(), ConfigError>,
    {
        let _guard = self.writer.lock().await;

        let (name, mut file) = self
            .repo_files()
            .await?
            .into_iter()
            .find(|(_, f)| f.sections.iter().any(|(sid, _)| sid == id))
            .ok_or_else(|| ConfigError::NotFound(format!("Repository {}", id)))?;

        edit(&mut file)?;
        self.write(&name, &file).await?;

        let options = file
            .sections
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        Ok(Repository {
            id: id.to_string(),
            file: name,
            enabled: is_enabled(&options),
            options: options.into_iter().collect(),
        })
    }

    async fn add(&self, ctx: &RequestContext) -> Result<Repository, ConfigError> {
        let id = ctx
            .field("id")
            .ok_or_else(|| ConfigError::Invalid("Missing repository id".to_string()))?;
        validate_id(&id)?;

        let mut options = collect_options(ctx)?;
        if !options.iter().any(|(k, _)| k == "baseurl" || k == "mirrorlist") {
            return Err(ConfigError::Invalid(
                "Either 'baseurl' or 'mirrorlist' is required".to_string(),
            ));
        }
        if !options.iter().any(|(k, _)| k == "name") {
            options.insert(0, ("name".to_string(), id.clone()));
        }
        if !options.iter().any(|(k, _)| k == "enabled") {
            options.push(("enabled".to_string(), "1".to_string()));
        }

        let _guard = self.writer.lock().await;

        let existing = self.repo_files().await?;
        if existing.iter().any(|(_, f)| f.sections.iter().any(|(sid, _)| *sid == id)) {
            return Err(ConfigError::Invalid(format!("Repository {} already exists", id)));
        }

        let name = format!("{}.repo", id);
        let mut file = match existing.into_iter().find(|(n, _)| *n == name) {
            Some((_, file)) => file,
            None => {
                // Present on disk but skipped as malformed; never overwrite it
                let on_disk = tokio::fs::try_exists(self.repo_dir.join(&name))
                    .await
                    .unwrap_or(true);
                if on_disk {
                    warn!(file = %name, "Refusing to replace unreadable repository file");
                    return Err(ConfigError::Invalid(format!(
                        "Repository file {} exists but could not be parsed",
                        name
                    )));
                }
                RepoFile::default()
            }
        };
        file.sections.push((id.clone(), options.clone()));
        self.write(&name, &file).await?;

        info!(repo = %id, "Added repository");
        Ok(Repository {
            id,
            file: name,
            enabled: is_enabled(&options),
            options: options.into_iter().collect(),
        })
    }
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
    if REPO_ID.is_match(id) && id.len() <= 128 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("Invalid repository id '{}'", id)))
    }
}

/// Editable options present in the request, validated and normalized
fn collect_options(ctx: &RequestContext) -> Result<Vec<(String, String)>, ConfigError> {
    let mut options = Vec::new();
    for key in EDITABLE_KEYS {
        let Some(value) = ctx.field(key) else {
            continue;
        };
        let value = value.trim().to_string();
        if value.contains(['\n', '\r']) {
            return Err(ConfigError::Invalid(format!("'{}' must be a single line", key)));
        }

        let value = match *key {
            "enabled" | "gpgcheck" => match parse_flag(&value) {
                Some(true) => "1".to_string(),
                Some(false) => "0".to_string(),
                None => return Err(ConfigError::Invalid(format!("'{}' must be a boolean", key))),
            },
            "baseurl" | "mirrorlist" | "gpgkey" => {
                if !value.split_whitespace().all(is_repo_url) {
                    return Err(ConfigError::Invalid(format!("'{}' must be a URL", key)));
                }
                value
            }
            _ => value,
        };
        options.push((key.to_string(), value));
    }
    Ok(options)
}

fn is_repo_url(value: &str) -> bool {
    ["http://", "https://", "ftp://", "file://"]
        .iter()
        .any(|scheme| value.starts_with(scheme) && value.len() > scheme.len())
}

#[async_trait]
impl OperationFamily for RepositoryFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Repository
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "list" => json_reply(serde_json::json!({ "repos": self.list().await? })),
            "item" => json_reply(self.find(ctx.require_arg()?).await?),
            "add" => json_reply(self.add(&ctx).await?),
            "update" => {
                let id = ctx.require_arg()?;
                let options = collect_options(&ctx)?;
                if options.is_empty() {
                    return Err(ConfigError::Invalid("Nothing to update".to_string()).into());
                }
                let repo = self
                    .edit(id, |file| {
                        if let Some(section) = file.section_mut(id) {
                            for (key, value) in &options {
                                set_option(section, key, value);
                            }
                        }
                        Ok(())
                    })
                    .await?;
                info!(repo = %id, "Updated repository");
                json_reply(repo)
            }
            "delete" => {
                let id = ctx.require_arg()?;
                self.edit(id, |file| {
                    file.remove(id);
                    Ok(())
                })
                .await?;
                info!(repo = %id, "Deleted repository");
                json_reply(serde_json::json!({ "ok": true, "id": id }))
            }
            "enable" | "disable" => {
                let id = ctx.require_arg()?;
                let flag = if ctx.command == "enable" { "1" } else { "0" };
                let repo = self
                    .edit(id, |file| {
                        if let Some(section) = file.section_mut(id) {
                            set_option(section, "enabled", flag);
                        }
                        Ok(())
                    })
                    .await?;
                info!(repo = %id, enabled = repo.enabled, "Toggled repository");
                json_reply(repo)
            }
            other => Err(GatewayError::UnsupportedOperation(format!("repos/yum/{}", other))),
        }
    }
}
