//! Server error types.

use dispatch_core::{CompileError, PermissionError, RegistryError, TopologyError};
use thiserror::Error;

/// Errors surfaced by the server shell.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("pipeline compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("internal error: {0}")]
    Internal(String),
}
