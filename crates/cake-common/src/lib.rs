//! Common types for cake: errors, configuration, the status event bus and
//! helpers for driving external tools.

#![cfg_attr(not(any(test, feature = "mock")), deny(missing_docs))]

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod poll;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the bootstrap VM listens on for the engine binary
pub const UPLOAD_PORT: u16 = 50000;

/// Port the bootstrap VM listens on for shell commands
pub const COMMAND_PORT: u16 = 50001;

/// Port the bootstrap VM listens on for the spec document
pub const CONFIG_UPLOAD_PORT: u16 = 50002;

/// Where the engine binary lands on the bootstrap VM
pub const REMOTE_EXECUTABLE: &str = "/tmp/cake";

/// Where the spec document lands on the bootstrap VM
pub const REMOTE_CONFIG: &str = "/root/.cake.yaml";

/// Written by the bootstrap VM's first-boot script once every prerequisite
/// is installed
pub const PREREQUISITES_MARKER: &str = "/tmp/cake-prerequisites-ready";

/// Where the remote engine's stdout is redirected
pub const REMOTE_OUTPUT: &str = "/tmp/cake.out";
