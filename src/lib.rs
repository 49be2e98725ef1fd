//! Overlay network bootstrap for container hosts.
//!
//! Discovers the coordination store from a peer, provisions the flannel
//! overlay daemon against it, waits for the daemon's subnet lease, points
//! the local container runtime (docker or lxc) at the leased subnet and
//! advertises the resulting bridge to dependent peers.

pub mod cidr;
pub mod command;
pub mod config;
pub mod error;
pub mod etcd;
pub mod install;
pub mod lease;
pub mod lock;
pub mod notifier;
pub mod orchestrator;
pub mod overlay;
pub mod peer;
pub mod runtime;
pub mod templates;

#[cfg(test)]
mod testing;

pub use error::{BootstrapError, Result};
pub use orchestrator::{Event, Orchestrator, RunOutcome};
