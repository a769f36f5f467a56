//! Hostgate
//!
//! Privileged HTTP gateway for administering a single Linux host.
//!
//! # Features
//!
//! - **Pattern routing**: ordered regex table, first match wins
//! - **Sessions**: cookie sessions with XSRF protection on mutating calls
//! - **Process control**: list, start, stop, restart and signal processes
//! - **Host status**: network, time, NTP and batch `/proc` queries
//! - **Certificates**: self-signed generation, upload and force-HTTPS
//! - **Yum repositories**: `.repo` file editing
//! - **Settings**: TOML document with optimistic concurrency
//!
//! # Architecture
//!
//! ```text
//! Browser ──► axum fallback ──► PatternRouter ──► AuthGate ──► Dispatcher
//!                                                                  │
//!                  ┌───────────┬──────────┬───────────┬────────────┤
//!                  ▼           ▼          ▼           ▼            ▼
//!               process     network     time/ssl    repos     setting/operation
//!                  │                                              │
//!               /proc, nix                                   ConfigStore
//! ```

pub mod atomic;
pub mod certs;
pub mod config;
pub mod error;
pub mod families;
pub mod gateway;
pub mod store;
pub mod system;
pub mod tls;

pub use certs::CertificateStore;
pub use config::GatewayConfig;
pub use error::{AuthError, CertificateError, ConfigError, GatewayError, ProcessError};
pub use gateway::{serve, Gateway};
pub use store::{ConfigDocument, ConfigStore, ConfigValue};
