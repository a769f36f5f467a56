//! Embedded pages and static assets

use super::json_reply;
use crate::error::GatewayError;
use crate::gateway::dispatch::{CommandSpec, OperationFamily, Reply, RequestContext};
use crate::gateway::router::FamilyId;
use async_trait::async_trait;
use rust_embed::Embed;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Static files served under `/css`, `/js`, `/lib`, ...
#[derive(Embed)]
#[folder = "assets/public/"]
struct PublicAssets;

/// Page templates, `{group}/{page}.html`
#[derive(Embed)]
#[folder = "assets/templates/"]
struct Templates;

fn is_segment(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `/page/{group}/{page}`
pub struct PageFamily;

#[async_trait]
impl OperationFamily for PageFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Page
    }

    fn commands(&self) -> &'static [CommandSpec] {
        const COMMANDS: &[CommandSpec] = &[CommandSpec::read("render")];
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let [group, page] = ctx.captures.as_slice() else {
            return Err(GatewayError::RouteNotFound);
        };
        if !is_segment(group) || !is_segment(page) {
            return Err(GatewayError::RouteNotFound);
        }

        let name = format!("{}/{}.html", group, page);
        match Templates::get(&name) {
            Some(content) => Ok(Reply::Html(String::from_utf8_lossy(&content.data).into_owned())),
            None => {
                debug!(template = %name, "No such template");
                Err(GatewayError::RouteNotFound)
            }
        }
    }
}

/// Embedded static files
pub struct AssetFamily;

#[async_trait]
impl OperationFamily for AssetFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Asset
    }

    fn commands(&self) -> &'static [CommandSpec] {
        const COMMANDS: &[CommandSpec] = &[CommandSpec::read("asset")];
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let path = ctx.require_arg()?.trim_start_matches('/');

        // Security: prevent path traversal
        if path.contains("..") {
            return Err(GatewayError::BadRequest("Invalid asset path".to_string()));
        }

        match PublicAssets::get(path) {
            Some(content) => Ok(Reply::Bytes {
                content_type: mime_guess::from_path(path).first_or_octet_stream().to_string(),
                disposition: None,
                data: content.data.into_owned(),
            }),
            None => Err(GatewayError::RouteNotFound),
        }
    }
}

/// Static files of installed plugins, read from disk under `/api/plugins`
pub struct PluginFamily {
    root: PathBuf,
}

impl PluginFamily {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf, GatewayError> {
        let mut resolved = self.root.clone();
        for component in Path::new(requested.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(GatewayError::BadRequest("Invalid plugin path".to_string())),
            }
        }
        if resolved == self.root {
            return Err(GatewayError::RouteNotFound);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl OperationFamily for PluginFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Plugin
    }

    fn commands(&self) -> &'static [CommandSpec] {
        const COMMANDS: &[CommandSpec] = &[CommandSpec::read("asset")];
        COMMANDS
    }

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let requested = ctx.arg.as_deref().unwrap_or_default();
        let path = self.resolve(requested)?;

        // Symlinks must not lead out of the plugin tree
        let (root, real) = match tokio::try_join!(
            tokio::fs::canonicalize(&self.root),
            tokio::fs::canonicalize(&path)
        ) {
            Ok(paths) => paths,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(GatewayError::RouteNotFound),
            Err(e) => {
                warn!(path = %path.display(), "Failed to resolve plugin file: {}", e);
                return Err(GatewayError::RouteNotFound);
            }
        };
        if !real.starts_with(&root) {
            warn!(path = %path.display(), "Plugin file escapes the plugin directory");
            return Err(GatewayError::RouteNotFound);
        }

        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(GatewayError::RouteNotFound),
        }
        let data = tokio::fs::read(&real).await.map_err(|e| {
            warn!(path = %real.display(), "Failed to read plugin file: {}", e);
            GatewayError::RouteNotFound
        })?;

        Ok(Reply::Bytes {
            content_type: mime_guess::from_path(&real).first_or_octet_stream().to_string(),
            disposition: None,
            data,
        })
    }
}

/// `/api/version`
pub struct VersionFamily;

#[async_trait]
impl OperationFamily for VersionFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Version
    }

    fn commands(&self) -> &'static [CommandSpec] {
        const COMMANDS: &[CommandSpec] = &[CommandSpec::read("version")];
        COMMANDS
    }

    async fn execute(&self, _ctx: RequestContext) -> Result<Reply, GatewayError> {
        json_reply(serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

/// `/`
pub struct IndexFamily;

#[async_trait]
impl OperationFamily for IndexFamily {
    fn id(&self) -> FamilyId {
        FamilyId::Index
    }

    fn commands(&self) -> &'static [CommandSpec] {
        const COMMANDS: &[CommandSpec] = &[CommandSpec::read("index")];
        COMMANDS
    }

    async fn execute(&self, _ctx: RequestContext) -> Result<Reply, GatewayError> {
        let html = match Templates::get("index.html") {
            Some(content) => String::from_utf8_lossy(&content.data).into_owned(),
            None => FALLBACK_INDEX.to_string(),
        };
        Ok(Reply::Html(html))
    }
}

/// Served when no index template is embedded
const FALLBACK_INDEX: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Hostgate</title>
</head>
<body>
    <h1>Hostgate</h1>
    <p>The gateway is running. Use the <code>/api</code> endpoints to manage this host.</p>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router::PatternRouter;
    use axum::http::Method;

    fn ctx(path: &str) -> RequestContext {
        let router = PatternRouter::with_default_routes().unwrap();
        let m = router.resolve(path).unwrap();
        RequestContext::from_match(&m, Method::GET)
    }

    #[tokio::test]
    async fn test_render_embedded_page() {
        let reply = PageFamily.execute(ctx("/page/server/overview")).await.unwrap();
        match reply {
            Reply::Html(html) => assert!(html.contains("<h1")),
            other => panic!("expected HTML, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_page_is_not_found() {
        let err = PageFamily.execute(ctx("/page/server/missing")).await.unwrap_err();
        assert_eq!(err.kind(), "RouteNotFound");

        let err = PageFamily.execute(ctx("/page/server/a.b")).await.unwrap_err();
        assert_eq!(err.kind(), "RouteNotFound");
    }

    #[tokio::test]
    async fn test_asset_with_mime_type() {
        let reply = AssetFamily.execute(ctx("/css/app.css")).await.unwrap();
        match reply {
            Reply::Bytes { content_type, data, .. } => {
                assert_eq!(content_type, "text/css");
                assert!(!data.is_empty());
            }
            other => panic!("expected bytes, got {:?}", other),
        }

        let err = AssetFamily.execute(ctx("/js/missing.js")).await.unwrap_err();
        assert_eq!(err.kind(), "RouteNotFound");
    }

    #[tokio::test]
    async fn test_minified_asset_prefix() {
        match AssetFamily.execute(ctx("/js.min/hostgate.min.js")).await.unwrap() {
            Reply::Bytes { content_type, .. } => assert!(content_type.ends_with("javascript")),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plugin_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(plugins.join("monitor/css")).unwrap();
        std::fs::write(plugins.join("monitor/css/main.css"), "body {}").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "hidden").unwrap();
        let family = PluginFamily::new(plugins.clone());

        match family.execute(ctx("/api/plugins/monitor/css/main.css")).await.unwrap() {
            Reply::Bytes { content_type, data, .. } => {
                assert_eq!(content_type, "text/css");
                assert_eq!(data, b"body {}");
            }
            other => panic!("expected bytes, got {:?}", other),
        }

        for path in ["/api/plugins/monitor/missing.js", "/api/plugins/monitor", "/api/plugins/"] {
            let err = family.execute(ctx(path)).await.unwrap_err();
            assert_eq!(err.kind(), "RouteNotFound", "path {}", path);
        }

        let err = family.execute(ctx("/api/plugins/../secret.txt")).await.unwrap_err();
        assert_eq!(err.kind(), "BadRequest");

        std::os::unix::fs::symlink(dir.path().join("secret.txt"), plugins.join("leak.txt")).unwrap();
        let err = family.execute(ctx("/api/plugins/leak.txt")).await.unwrap_err();
        assert_eq!(err.kind(), "RouteNotFound");
    }

    #[tokio::test]
    async fn test_asset_rejects_traversal() {
        let err = AssetFamily.execute(ctx("/css/../../Cargo.toml")).await.unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[tokio::test]
    async fn test_version_and_index() {
        match VersionFamily.execute(ctx("/api/version")).await.unwrap() {
            Reply::Json(v) => {
                assert_eq!(v["name"], "hostgate");
                assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));
            }
            other => panic!("expected JSON, got {:?}", other),
        }

        match IndexFamily.execute(ctx("/")).await.unwrap() {
            Reply::Html(html) => assert!(html.contains("Hostgate")),
            other => panic!("expected HTML, got {:?}", other),
        }
    }
}
