//! Error taxonomy for the bootstrap sequence.
//!
//! Every fatal variant carries enough context (operation, target, status)
//! to diagnose a failure from the hook log alone.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Deployment configuration holds a value outside its allowed set.
    #[error("invalid configuration value for '{key}': {value:?} (expected one of {expected})")]
    Config {
        key: String,
        value: String,
        expected: &'static str,
    },

    /// Peer has not published enough data to derive the coordination endpoint.
    #[error("coordination endpoint not ready: peer has not published '{missing}'")]
    EndpointNotReady { missing: &'static str },

    /// Registering the overlay network in the coordination store failed.
    #[error("network init at {endpoint}{key} failed: {reason}")]
    NetworkInit {
        endpoint: String,
        key: String,
        reason: String,
    },

    /// A service could not be stopped, started or restarted.
    #[error("service {action} {service} failed (exit {code:?}): {stderr}")]
    ServiceControl {
        service: String,
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    /// Any other external command exited unsuccessfully.
    #[error("command '{command}' failed (exit {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The overlay daemon never published its lease.
    #[error("timed out after {timeout:?} waiting for lease at {}", path.display())]
    WaitTimeout { path: PathBuf, timeout: Duration },

    /// Shutdown was requested while waiting.
    #[error("cancelled while waiting for lease at {}", path.display())]
    Cancelled { path: PathBuf },

    #[error("failed to render template '{template}': {reason}")]
    TemplateRender { template: String, reason: String },

    #[error("invalid IPv4 CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("malformed lease at {}: {reason}", path.display())]
    LeaseParse { path: PathBuf, reason: String },

    /// Another invocation holds the runtime reconfiguration lock.
    #[error("runtime reconfiguration already in progress (lock {} held by pid {pid})", path.display())]
    Busy { path: PathBuf, pid: String },

    #[error("peer channel {operation} failed: {reason}")]
    Peer {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Errors that resolve themselves when the triggering event is re-delivered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WaitTimeout { .. } | Self::Cancelled { .. } | Self::Busy { .. }
        )
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
