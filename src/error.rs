//! Error types
//!
//! Link procedures fail with [`LinkError`]; the recovery state machine is the
//! boundary that catches them. Profile problems surface as [`ConfigError`].

use crate::link::LinkKind;

/// Failure of a link setup, cleanup or selection step
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("command '{command}' failed (rc={code:?}): {output}")]
    CommandFailure {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("kernel module {0} not loaded")]
    ModuleMissing(String),

    #[error("interface {0} not found")]
    InterfaceMissing(String),

    #[error("peer selection failed: {0}")]
    Selection(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Profile loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Managed companion process errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("no process registered as {0}")]
    Unknown(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stop {name}: {source}")]
    Stop {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned to external callers of the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("link {0} is not managed by this node")]
    UnknownLink(LinkKind),
}
