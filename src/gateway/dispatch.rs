//! Dispatcher
//!
//! Binds a resolved route to its operation family and runs the command.
//!
//! Families are looked up by [`FamilyId`] in a fixed table built at startup.
//! Each family declares its command table; a command outside the table is
//! rejected with `UnsupportedOperation` before the family sees it. Handler
//! panics are contained by running each command on its own task.

use super::router::{FamilyId, RouteMatch};
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::{
    http::{header, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

/// One command of a family's command table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Changes host or gateway state; requires an XSRF token
    pub mutating: bool,
}

impl CommandSpec {
    pub const fn read(name: &'static str) -> Self {
        Self { name, mutating: false }
    }

    pub const fn write(name: &'static str) -> Self {
        Self { name, mutating: true }
    }
}

/// Command result
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Html(String),
    Bytes {
        content_type: String,
        disposition: Option<String>,
        data: Vec<u8>,
    },
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Json(value) => Json(value).into_response(),
            Reply::Html(html) => Html(html).into_response(),
            Reply::Bytes {
                content_type,
                disposition,
                data,
            } => {
                let mut response = (StatusCode::OK, data).into_response();
                let headers = response.headers_mut();
                if let Ok(value) = content_type.parse() {
                    headers.insert(header::CONTENT_TYPE, value);
                }
                if let Some(value) = disposition.and_then(|d| d.parse().ok()) {
                    headers.insert(header::CONTENT_DISPOSITION, value);
                }
                response
            }
        }
    }
}

/// Normalized request passed to a family
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub command: String,
    pub arg: Option<String>,
    /// All decoded path captures, in pattern order
    pub captures: Vec<String>,
    pub static_params: BTreeMap<String, String>,
    pub query: HashMap<String, String>,
    /// Parsed JSON body, `Null` when absent
    pub body: Value,
    /// Authenticated user, `None` on public routes
    pub identity: Option<String>,
}

impl RequestContext {
    /// Build a context from a route match
    ///
    /// A `command` static parameter names the command and leaves every
    /// capture as an argument. Otherwise the first capture is the command
    /// and the second, if present, its argument.
    pub fn from_match(m: &RouteMatch<'_>, method: Method) -> Self {
        let static_params = m.route.static_params.clone();
        let captures = m.captures.clone();

        let (command, arg) = match static_params.get("command") {
            Some(command) => (command.clone(), captures.first().cloned()),
            None => (
                captures.first().cloned().unwrap_or_default(),
                captures.get(1).cloned(),
            ),
        };

        Self {
            method,
            command,
            arg,
            captures,
            static_params,
            query: HashMap::new(),
            body: Value::Null,
            identity: None,
        }
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    /// Required argument
    pub fn require_arg(&self) -> Result<&str, GatewayError> {
        self.arg
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| GatewayError::BadRequest(format!("'{}' requires an argument", self.command)))
    }

    /// String field from the body, falling back to the query string
    pub fn field(&self, name: &str) -> Option<String> {
        match self.body.get(name) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => self.query.get(name).cloned(),
        }
    }

    /// Whether the request is a read (GET/HEAD)
    pub fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// A set of commands reachable under one route prefix
#[async_trait]
pub trait OperationFamily: Send + Sync {
    fn id(&self) -> FamilyId;

    fn commands(&self) -> &'static [CommandSpec];

    async fn execute(&self, ctx: RequestContext) -> Result<Reply, GatewayError>;

    fn command(&self, name: &str) -> Option<CommandSpec> {
        self.commands().iter().find(|c| c.name == name).copied()
    }
}

/// Family lookup and invocation
#[derive(Default)]
pub struct Dispatcher {
    families: HashMap<FamilyId, Arc<dyn OperationFamily>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: Arc<dyn OperationFamily>) {
        self.families.insert(family.id(), family);
    }

    pub fn with(mut self, family: Arc<dyn OperationFamily>) -> Self {
        self.register(family);
        self
    }

    pub fn family(&self, id: FamilyId) -> Option<&Arc<dyn OperationFamily>> {
        self.families.get(&id)
    }

    /// Whether `command` on `family` is marked mutating
    pub fn is_mutating(&self, family: FamilyId, command: &str) -> bool {
        self.families
            .get(&family)
            .and_then(|f| f.command(command))
            .is_some_and(|c| c.mutating)
    }

    /// Run the command named in `ctx` on `family`
    pub async fn dispatch(&self, family: FamilyId, ctx: RequestContext) -> Result<Reply, GatewayError> {
        let handler = self
            .families
            .get(&family)
            .cloned()
            .ok_or_else(|| GatewayError::UnsupportedOperation(family.to_string()))?;

        if handler.command(&ctx.command).is_none() {
            return Err(GatewayError::UnsupportedOperation(format!(
                "{}/{}",
                family, ctx.command
            )));
        }

        let command = ctx.command.clone();
        debug!(family = %family, command = %command, arg = ?ctx.arg, "Dispatching");

        match tokio::spawn(async move { handler.execute(ctx).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(family = %family, command = %command, "Handler task failed: {}", e);
                Err(GatewayError::Internal)
            }
        }
    }
}
