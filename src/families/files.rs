//! File preview, download and upload
//!
//! Paths are taken relative to the configured file root. Any `..`
//! component is rejected before the filesystem is touched.

use super::json_reply;
use crate::atomic;
use crate::error::{AuthError, GatewayError};
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::read("preview"),
    CommandSpec::read("download"),
    CommandSpec::write("upload"),
];

/// Bytes shown by `preview`
const PREVIEW_LIMIT: u64 = 64 * 1024;

/// Largest file served by `download`
const DOWNLOAD_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct FilePreview {
    pub path: String,
    pub size: u64,
    pub binary: bool,
    pub truncated: bool,
    /// First `PREVIEW_LIMIT` bytes as text; absent for binary files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub struct FilesFamily {
    root: PathBuf,
}

impl FilesFamily {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a request path onto the file root
    fn resolve(&self, requested: &str) -> Result<PathBuf, GatewayError> {
        let relative = Path::new(requested.trim_start_matches('/'));
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(GatewayError::BadRequest(format!("Invalid path '{}'", requested)));
                }
            }
        }

        if resolved == self.root {
            return Err(GatewayError::BadRequest("A file path is required".to_string()));
        }
        Ok(resolved)
    }

    async fn preview(&self, requested: &str) -> Result<FilePreview, GatewayError> {
        let path = self.resolve(requested)?;
        let size = regular_file_size(&path).await?;

        let file = tokio::fs::File::open(&path).await.map_err(|e| io_failure(&path, e))?;
        let mut head = Vec::with_capacity(size.min(PREVIEW_LIMIT) as usize);
        file.take(PREVIEW_LIMIT)
            .read_to_end(&mut head)
            .await
            .map_err(|e| io_failure(&path, e))?;

        let truncated = size > head.len() as u64;
        let content = decode_text(&head, truncated);

        Ok(FilePreview {
            path: requested.to_string(),
            size,
            binary: content.is_none(),
            truncated,
            content,
        })
    }

    async fn download(&self, requested: &str) -> Result<Reply, GatewayError> {
        let path = self.resolve(requested)?;
        let size = regular_file_size(&path).await?;
        if size > DOWNLOAD_LIMIT {
            return Err(GatewayError::BadRequest("File is too large to download".to_string()));
        }

        let data = tokio::fs::read(&path).await.map_err(|e| io_failure(&path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().replace(['"', '\\', '\r', '\n'], "_"))
            .unwrap_or_else(|| "download".to_string());

        Ok(Reply::Bytes {
            content_type: mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string(),
            disposition: Some(format!("attachment; filename=\"{}\"", name)),
            data,
        })
    }

    async fn upload(&self, ctx: &RequestContext) -> Result<Reply, GatewayError> {
        let requested = ctx
            .field("path")
            .ok_or_else(|| GatewayError::BadRequest("Missing 'path'".to_string()))?;
        let encoded = ctx
            .field("content")
            .ok_or_else(|| GatewayError::BadRequest("Missing 'content'".to_string()))?;

        let path = self.resolve(&requested)?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| GatewayError::BadRequest("'content' is not valid base64".to_string()))?;

        let parent_is_dir = match path.parent() {
            Some(parent) => tokio::fs::metadata(parent).await.is_ok_and(|m| m.is_dir()),
            None => false,
        };
        if !parent_is_dir {
            return Err(GatewayError::BadRequest("Parent directory does not exist".to_string()));
        }
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(GatewayError::BadRequest("Target is a directory".to_string()));
        }

        atomic::replace_file(&path, &data, Some(0o644))
            .await
            .map_err(|e| io_failure(&path, e))?;

        info!(path = %path.display(), bytes = data.len(), "File uploaded");
        json_reply(serde_json::json!({ "ok": true, "path": requested, "size": data.len() }))
    }
}

#[async_trait]
impl OperationFamily for FilesFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Files
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        match ctx.command.as_str() {
            "preview" => json_reply(self.preview(ctx.require_arg()?).await?),
            "download" => self.download(ctx.require_arg()?).await,
            "upload" => self.upload(&ctx).await,
            other => Err(GatewayError::UnsupportedOperation(format!("file/{}", other))),
        }
    }
}

async fn regular_file_size(path: &Path) -> Result<u64, GatewayError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| io_failure(path, e))?;
    if !meta.is_file() {
        return Err(GatewayError::BadRequest("Not a regular file".to_string()));
    }
    Ok(meta.len())
}

/// Text content, or `None` for binary data. A cut-off multibyte character
/// at the end of a truncated read is dropped rather than treated as binary.
fn decode_text(head: &[u8], truncated: bool) -> Option<String> {
    if head.contains(&0) {
        return None;
    }
    match std::str::from_utf8(head) {
        Ok(text) => Some(text.to_string()),
        Err(e) if truncated && e.error_len().is_none() => {
            Some(String::from_utf8_lossy(&head[..e.valid_up_to()]).into_owned())
        }
        Err(_) => None,
    }
}

fn io_failure(path: &Path, err: io::Error) -> GatewayError {
    match err.kind() {
        io::ErrorKind::NotFound => GatewayError::RouteNotFound,
        io::ErrorKind::PermissionDenied => AuthError::Forbidden.into(),
        _ => {
            warn!(path = %path.display(), "File operation failed: {}", err);
            GatewayError::Internal
        }
    }
}
