//! HTTP gateway
//!
//! Request pipeline pieces: the regex route table, session and XSRF
//! checks, family dispatch and the axum server that strings them together.

pub mod auth;
pub mod dispatch;
pub mod router;
pub mod server;

pub use auth::{Access, AuthGate, Session};
pub use dispatch::{CommandSpec, Dispatcher, OperationFamily, Reply, RequestContext};
pub use router::{FamilyId, PatternRouter, RouteDescriptor, RouteMatch};
pub use server::{serve, Gateway};
