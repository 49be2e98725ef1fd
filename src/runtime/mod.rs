//! Container runtime reconfiguration for a leased subnet.

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::command::{CommandRunner, ServiceControl};
use crate::config::{ContainerRuntime, DeploymentConfig, Settings};
use crate::error::{BootstrapError, Result};
use crate::lease::SubnetLease;
use crate::templates::{write_if_changed, TemplateRenderer};

pub mod docker;
pub mod lxc;
pub use docker::DockerReconfigurer;
pub use lxc::LxcReconfigurer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The runtime already runs with this lease; nothing was restarted.
    AlreadyApplied,
}

/// Records what a runtime was last restarted with. Written only after the
/// restart succeeds, so a run that failed halfway never reads as applied.
#[derive(Debug, Clone)]
pub struct AppliedMarker {
    path: PathBuf,
}

impl AppliedMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn matches(&self, applied: &str) -> Result<bool> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(recorded) => Ok(recorded == applied),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BootstrapError::io("read marker", &self.path, e)),
        }
    }

    /// Forget the previous application before the runtime is touched.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Cleared {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::io("remove marker", &self.path, e)),
        }
    }

    pub async fn record(&self, applied: &str) -> Result<()> {
        write_if_changed(&self.path, applied).await.map(|_| ())
    }
}

/// The configured runtime, chosen once per event.
pub enum RuntimeReconfigurer {
    Docker(DockerReconfigurer),
    Lxc(LxcReconfigurer),
}

impl RuntimeReconfigurer {
    pub fn for_config(
        config: &DeploymentConfig,
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        match config.container_runtime {
            ContainerRuntime::Docker => Self::Docker(DockerReconfigurer::new(
                config.docker_origin,
                settings.defaults_dir.clone(),
                settings.bridge_name.clone(),
                AppliedMarker::new(settings.state_dir.join("docker.applied")),
                runner,
            )),
            ContainerRuntime::Lxc => Self::Lxc(LxcReconfigurer {
                net_path: settings.lxc_net_path.clone(),
                conf_path: settings.lxc_conf_path.clone(),
                bridge: settings.lxc_bridge.clone(),
                service: settings.lxc_service.clone(),
                marker: AppliedMarker::new(settings.state_dir.join("lxc.applied")),
                services: ServiceControl::new(runner),
                renderer,
            }),
        }
    }

    pub fn bridge_name(&self) -> &str {
        match self {
            Self::Docker(docker) => docker.bridge_name(),
            Self::Lxc(lxc) => lxc.bridge_name(),
        }
    }

    pub async fn apply(&self, lease: &SubnetLease) -> Result<ApplyOutcome> {
        match self {
            Self::Docker(docker) => docker.apply(lease).await,
            Self::Lxc(lxc) => lxc.apply(lease).await,
        }
    }
}
