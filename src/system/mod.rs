//! Host system primitives
//!
//! Thin async wrappers over the pieces of the OS the operation families
//! touch: subprocesses with bounded runtime, `/proc` process records, and
//! the PID marker file.

pub mod command;
pub mod pidfile;
pub mod procfs;

pub use command::{run, CommandError, CommandOutput};
pub use pidfile::PidFile;
pub use procfs::{ProcessRecord, ProcessState};
