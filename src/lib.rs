// AgentGate - protocol-bridging reverse proxy
// Core library module

pub mod balance;
pub mod channel;
pub mod config;
pub mod error;
pub mod extension;
pub mod server;
pub mod service;
pub mod upstream;

pub use error::{AgentError, Result};
pub use service::{Service, ServiceState};

/// Crate version, surfaced at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
