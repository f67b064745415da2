//! Error types for agent operations.
//!
//! Errors fall into the classes the reconciliation loop cares about:
//! transient control-plane or switch failures (retried on the next cycle),
//! configuration mismatches (logged, never retried), and fatal startup
//! failures (the process exits).

use std::io;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while programming the switch or talking to the plugin.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Control-plane call failed.
    #[error("Plugin RPC failed: {operation}: {message}")]
    Rpc {
        /// The RPC that failed (e.g., "get_device_details").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Control-plane call did not answer in time.
    #[error("Plugin RPC timed out: {operation}")]
    RpcTimeout {
        /// The RPC that timed out.
        operation: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Switch port not found.
    #[error("Port '{port}' not found on bridge {bridge}")]
    PortNotFound {
        /// The bridge that was searched.
        bridge: String,
        /// The port name or interface id.
        port: String,
    },

    /// Bridge does not report a datapath id.
    #[error("Bridge {bridge} has no datapath after {attempts} attempts")]
    DatapathUnavailable {
        /// The bridge name.
        bridge: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A flow entry violated a construction rule.
    #[error("Invalid flow: {message}")]
    InvalidFlow {
        /// Error message.
        message: String,
    },

    /// Unrecoverable startup failure.
    #[error("Fatal: {message}")]
    Fatal {
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates an RPC error.
    pub fn rpc(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an RPC timeout error.
    pub fn rpc_timeout(operation: impl Into<String>) -> Self {
        Self::RpcTimeout {
            operation: operation.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a port not found error.
    pub fn port_not_found(bridge: impl Into<String>, port: impl Into<String>) -> Self {
        Self::PortNotFound {
            bridge: bridge.into(),
            port: port.into(),
        }
    }

    /// Creates an invalid flow error.
    pub fn invalid_flow(message: impl Into<String>) -> Self {
        Self::InvalidFlow {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on the next reconciliation cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Rpc { .. }
                | AgentError::RpcTimeout { .. }
                | AgentError::ShellCommandFailed { .. }
                | AgentError::PortNotFound { .. }
        )
    }

    /// Returns true if the process must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Fatal { .. }
                | AgentError::DatapathUnavailable { .. }
                | AgentError::InvalidConfig { .. }
        )
    }
}
