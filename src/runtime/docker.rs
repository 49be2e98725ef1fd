use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use super::{AppliedMarker, ApplyOutcome};
use crate::command::{run_checked, CommandRunner, ServiceControl};
use crate::config::DockerOrigin;
use crate::error::{BootstrapError, Result};
use crate::lease::SubnetLease;

/// Prefix shared by every options line this tool has written.
const MANAGED_PREFIX: &str = "DOCKER_OPTS=\"$DOCKER_OPTS --bip=";

/// Points the docker daemon's default bridge at the leased subnet.
pub struct DockerReconfigurer {
    origin: DockerOrigin,
    env_path: PathBuf,
    bridge: String,
    marker: AppliedMarker,
    runner: Arc<dyn CommandRunner>,
    services: ServiceControl,
}

impl DockerReconfigurer {
    pub fn new(
        origin: DockerOrigin,
        defaults_dir: impl Into<PathBuf>,
        bridge: impl Into<String>,
        marker: AppliedMarker,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            origin,
            env_path: defaults_dir.into().join(origin.service_name()),
            bridge: bridge.into(),
            marker,
            services: ServiceControl::new(runner.clone()),
            runner,
        }
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge
    }

    pub fn env_path(&self) -> &PathBuf {
        &self.env_path
    }

    /// Daemon flags for the lease: bridge at the first usable host address.
    pub fn options(lease: &SubnetLease) -> String {
        format!(
            "--bip={} --mtu={}",
            lease.subnet.bridge_address(),
            lease.mtu
        )
    }

    pub fn env_line(lease: &SubnetLease) -> String {
        format!("DOCKER_OPTS=\"$DOCKER_OPTS {}\"", Self::options(lease))
    }

    pub async fn apply(&self, lease: &SubnetLease) -> Result<ApplyOutcome> {
        let line = Self::env_line(lease);
        let existing = match tokio::fs::read_to_string(&self.env_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(BootstrapError::io("read", &self.env_path, e)),
        };

        let present = existing.lines().any(|l| l.trim() == line);
        if present && self.marker.matches(&line).await? {
            info!("Docker already initialized with {}, skipping", line);
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        self.marker.clear().await?;

        if !present {
            // Options from an earlier lease would name the old bridge address.
            let mut contents: String = existing
                .lines()
                .filter(|l| !l.trim_start().starts_with(MANAGED_PREFIX))
                .map(|l| format!("{l}\n"))
                .collect();
            contents.push_str(&line);
            contents.push('\n');
            tokio::fs::write(&self.env_path, contents)
                .await
                .map_err(|e| BootstrapError::io("write", &self.env_path, e))?;
            info!("Appended '{}' to {}", line, self.env_path.display());
        }

        self.replace_bridge().await?;
        self.marker.record(&line).await?;
        info!("Docker initialized");
        Ok(ApplyOutcome::Applied)
    }

    /// Stopping docker leaves its bridge behind with the old address, so the
    /// device is removed before the restart recreates it.
    async fn replace_bridge(&self) -> Result<()> {
        let service = self.origin.service_name();
        self.services.stop(service).await?;
        run_checked(
            self.runner.as_ref(),
            &["ip", "link", "set", "dev", self.bridge.as_str(), "down"],
        )
        .await?;
        run_checked(
            self.runner.as_ref(),
            &["ip", "link", "delete", self.bridge.as_str(), "type", "bridge"],
        )
        .await?;
        self.services.restart(service).await
    }
}
