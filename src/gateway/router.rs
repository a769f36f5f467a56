//! Pattern Router
//!
//! Data-driven route table. Each [`RouteDescriptor`] binds a path pattern to
//! an operation family plus static parameters. Patterns are compiled once,
//! anchored at both ends, and tried in declaration order; the first match
//! wins.
//!
//! # Ordering contract
//!
//! Specific routes must be declared before general ones. A general pattern
//! placed earlier silently shadows everything after it that it also
//! matches. Only the presence of a trailing catch-all is checked at
//! construction; the rest of the ordering is the table author's
//! responsibility.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Operation family a route dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyId {
    Auth,
    Query,
    Network,
    Process,
    Time,
    Ssl,
    Repository,
    Setting,
    Operation,
    Files,
    Page,
    Asset,
    Plugin,
    Version,
    Index,
    NotFound,
}

impl FamilyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            FamilyId::Auth => "auth",
            FamilyId::Query => "query",
            FamilyId::Network => "network",
            FamilyId::Process => "process",
            FamilyId::Time => "time",
            FamilyId::Ssl => "ssl",
            FamilyId::Repository => "repository",
            FamilyId::Setting => "setting",
            FamilyId::Operation => "operation",
            FamilyId::Files => "files",
            FamilyId::Page => "page",
            FamilyId::Asset => "asset",
            FamilyId::Plugin => "plugin",
            FamilyId::Version => "version",
            FamilyId::Index => "index",
            FamilyId::NotFound => "not_found",
        }
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the route table
#[derive(Debug, Clone, Serialize)]
pub struct RouteDescriptor {
    pub name: &'static str,
    pub pattern: &'static str,
    pub family: FamilyId,
    pub static_params: BTreeMap<String, String>,
}

impl RouteDescriptor {
    pub fn new(name: &'static str, pattern: &'static str, family: FamilyId) -> Self {
        Self {
            name,
            pattern,
            family,
            static_params: BTreeMap::new(),
        }
    }

    /// Attach a static parameter
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.static_params.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("route table is empty")]
    Empty,

    #[error("invalid pattern for route '{name}': {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("last route '{0}' is not a catch-all")]
    MissingCatchAll(&'static str),
}

/// Result of resolving a path
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub route: &'a RouteDescriptor,
    /// Percent-decoded captures in pattern order; absent optional groups are
    /// omitted
    pub captures: Vec<String>,
}

struct CompiledRoute {
    descriptor: RouteDescriptor,
    matcher: Regex,
}

/// Ordered, first-match-wins path resolver
pub struct PatternRouter {
    routes: Vec<CompiledRoute>,
}

impl PatternRouter {
    /// Compile a route table
    pub fn new(table: Vec<RouteDescriptor>) -> Result<Self, RouterError> {
        let mut routes = Vec::with_capacity(table.len());

        for descriptor in table {
            let matcher = Regex::new(&format!("^(?:{})$", descriptor.pattern)).map_err(|source| {
                RouterError::InvalidPattern {
                    name: descriptor.name,
                    source,
                }
            })?;
            routes.push(CompiledRoute { descriptor, matcher });
        }

        let last = routes.last().ok_or(RouterError::Empty)?;
        if !["/", "/any", "/any/nested/path.ext"]
            .iter()
            .all(|probe| last.matcher.is_match(probe))
        {
            return Err(RouterError::MissingCatchAll(last.descriptor.name));
        }

        Ok(Self { routes })
    }

    /// Router over [`default_routes`]
    pub fn with_default_routes() -> Result<Self, RouterError> {
        Self::new(default_routes())
    }

    /// Find the first route whose pattern matches `path`
    ///
    /// Matching is structural only; the HTTP method plays no part.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            let caps = route.matcher.captures(path)?;
            let captures = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| percent_decode(m.as_str()))
                .collect();
            Some(RouteMatch {
                route: &route.descriptor,
                captures,
            })
        })
    }

    /// Declared routes, in order
    pub fn routes(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.routes.iter().map(|r| &r.descriptor)
    }
}

fn percent_decode(segment: &str) -> String {
    percent_encoding::percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned()
}

/// The gateway's route table
pub fn default_routes() -> Vec<RouteDescriptor> {
    use FamilyId::*;

    vec![
        RouteDescriptor::new("xsrf", r"/api/xsrf", Auth).param("command", "xsrf"),
        RouteDescriptor::new("authstatus", r"/api/authstatus", Auth).param("command", "authstatus"),
        RouteDescriptor::new("login", r"/api/login", Auth).param("command", "login"),
        RouteDescriptor::new("logout", r"/api/logout", Auth).param("command", "logout"),
        RouteDescriptor::new("query", r"/api/query/(.+)", Query).param("command", "items"),
        RouteDescriptor::new("network", r"/api/network/(.+?)(?:/(.+))?", Network),
        RouteDescriptor::new("process", r"/api/process/(.+?)(?:/(.+))?", Process),
        RouteDescriptor::new("time", r"/api/time/(.+?)(?:/(.+))?", Time),
        RouteDescriptor::new("ssl", r"/api/ssl/(.+?)(?:/(.+))?", Ssl),
        RouteDescriptor::new("repos", r"/api/repos/yum/(.+?)(?:/(.+))?", Repository),
        RouteDescriptor::new("setting", r"/api/setting/(.+)", Setting),
        RouteDescriptor::new("operation", r"/api/operation/(.+)", Operation),
        RouteDescriptor::new("file_preview", r"/page/file/preview/(.+)", Files).param("command", "preview"),
        RouteDescriptor::new("page", r"/page/(.+)/(.+)", Page).param("command", "render"),
        RouteDescriptor::new(
            "asset",
            r"/((?:css|js|js\.min|lib|partials|images|favicon\.ico|robots\.txt)(?:/.*)?)",
            Asset,
        )
        .param("command", "asset"),
        RouteDescriptor::new("file_download", r"/api/file/download/(.+)", Files)
            .param("command", "download"),
        RouteDescriptor::new("file_upload", r"/api/file/upload", Files).param("command", "upload"),
        RouteDescriptor::new("plugins", r"/api/plugins/(.*)", Plugin).param("command", "asset"),
        RouteDescriptor::new("version", r"/api/version", Version).param("command", "version"),
        RouteDescriptor::new("index", r"/", Index).param("command", "index"),
        RouteDescriptor::new("not_found", r"/.*", NotFound).param("status", "404"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> PatternRouter {
        PatternRouter::with_default_routes().unwrap()
    }

    fn resolve(path: &str) -> (&'static str, FamilyId, Vec<String>) {
        let router = router();
        let m = router.resolve(path).unwrap();
        (m.route.name, m.route.family, m.captures)
    }

    #[test]
    fn test_optional_trailing_capture() {
        let (name, family, caps) = resolve("/api/process/restart/123");
        assert_eq!(name, "process");
        assert_eq!(family, FamilyId::Process);
        assert_eq!(caps, vec!["restart", "123"]);

        let (_, family, caps) = resolve("/api/process/list");
        assert_eq!(family, FamilyId::Process);
        assert_eq!(caps, vec!["list"]);
    }

    #[test]
    fn test_trailing_capture_keeps_slashes() {
        let (_, family, caps) = resolve("/api/network/ifconfig/eth0/extra");
        assert_eq!(family, FamilyId::Network);
        assert_eq!(caps, vec!["ifconfig", "eth0/extra"]);
    }

    #[test]
    fn test_no_capture_routes() {
        for (path, name) in [
            ("/api/xsrf", "xsrf"),
            ("/api/authstatus", "authstatus"),
            ("/api/login", "login"),
            ("/api/logout", "logout"),
            ("/api/version", "version"),
            ("/api/file/upload", "file_upload"),
            ("/", "index"),
        ] {
            let (got, _, caps) = resolve(path);
            assert_eq!(got, name, "path {}", path);
            assert!(caps.is_empty(), "path {}", path);
        }
    }

    #[test]
    fn test_two_mandatory_captures() {
        let (name, family, caps) = resolve("/page/server/overview");
        assert_eq!(name, "page");
        assert_eq!(family, FamilyId::Page);
        assert_eq!(caps, vec!["server", "overview"]);
    }

    #[test]
    fn test_file_preview_precedes_page() {
        let (name, family, caps) = resolve("/page/file/preview/etc/hosts");
        assert_eq!(name, "file_preview");
        assert_eq!(family, FamilyId::Files);
        assert_eq!(caps, vec!["etc/hosts"]);
    }

    #[test]
    fn test_repos_and_settings() {
        let (_, family, caps) = resolve("/api/repos/yum/item/epel");
        assert_eq!(family, FamilyId::Repository);
        assert_eq!(caps, vec!["item", "epel"]);

        let (_, family, caps) = resolve("/api/setting/server");
        assert_eq!(family, FamilyId::Setting);
        assert_eq!(caps, vec!["server"]);
    }

    #[test]
    fn test_assets() {
        let (name, _, caps) = resolve("/css/app.css");
        assert_eq!(name, "asset");
        assert_eq!(caps, vec!["css/app.css"]);

        let (name, _, caps) = resolve("/robots.txt");
        assert_eq!(name, "asset");
        assert_eq!(caps, vec!["robots.txt"]);

        let (name, _, caps) = resolve("/js.min/hostgate.min.js");
        assert_eq!(name, "asset");
        assert_eq!(caps, vec!["js.min/hostgate.min.js"]);

        // Prefix must be a whole segment
        let (name, _, _) = resolve("/cssx/app.css");
        assert_eq!(name, "not_found");
        let (name, _, _) = resolve("/js.minx/app.js");
        assert_eq!(name, "not_found");
    }

    #[test]
    fn test_plugin_files() {
        let (name, family, caps) = resolve("/api/plugins/monitor/js/main.js");
        assert_eq!(name, "plugins");
        assert_eq!(family, FamilyId::Plugin);
        assert_eq!(caps, vec!["monitor/js/main.js"]);
    }

    #[test]
    fn test_unserved_legacy_prefixes_fall_through() {
        for path in ["/api/backend/list", "/api/sitepackage/list", "/api/client/list"] {
            let (name, _, _) = resolve(path);
            assert_eq!(name, "not_found", "path {}", path);
        }
    }

    #[test]
    fn test_catch_all() {
        for path in ["/nope", "/api/unknown", "/api/process", "/api/process/", "/page/only"] {
            let (name, family, _) = resolve(path);
            assert_eq!(name, "not_found", "path {}", path);
            assert_eq!(family, FamilyId::NotFound);
        }
    }

    #[test]
    fn test_captures_are_percent_decoded() {
        let (_, _, caps) = resolve("/api/time/settimezone/America%2FNew_York");
        assert_eq!(caps, vec!["settimezone", "America/New_York"]);
    }

    #[test]
    fn test_static_params() {
        let router = router();
        let m = router.resolve("/api/file/download/tmp/x").unwrap();
        assert_eq!(m.route.static_params.get("command").map(String::as_str), Some("download"));
        assert_eq!(m.route.static_params.len(), 1);

        let m = router.resolve("/nope").unwrap();
        assert_eq!(m.route.static_params.get("status").map(String::as_str), Some("404"));
    }

    #[test]
    fn test_catch_all_first_shadows_everything() {
        let mut table = default_routes();
        let catch_all = table.pop().unwrap();
        table.insert(0, catch_all.clone());
        table.push(catch_all);
        let router = PatternRouter::new(table).unwrap();

        assert_eq!(router.resolve("/api/version").unwrap().route.name, "not_found");
        assert_eq!(router.resolve("/api/process/list").unwrap().route.name, "not_found");
    }

    #[test]
    fn test_page_before_file_preview_shadows_preview() {
        let mut table = default_routes();
        let preview = table.iter().position(|r| r.name == "file_preview").unwrap();
        let page = table.iter().position(|r| r.name == "page").unwrap();
        table.swap(preview, page);
        let router = PatternRouter::new(table).unwrap();

        let m = router.resolve("/page/file/preview/etc/hosts").unwrap();
        assert_eq!(m.route.name, "page");
        assert_eq!(m.captures, vec!["file/preview/etc", "hosts"]);
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(PatternRouter::new(Vec::new()), Err(RouterError::Empty)));

        let mut table = default_routes();
        table.pop();
        assert!(matches!(
            PatternRouter::new(table),
            Err(RouterError::MissingCatchAll("index"))
        ));

        let bad = vec![RouteDescriptor::new("bad", r"/(", FamilyId::NotFound)];
        assert!(matches!(
            PatternRouter::new(bad),
            Err(RouterError::InvalidPattern { name: "bad", .. })
        ));
    }
}
