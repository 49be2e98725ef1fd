use std::sync::Arc;

use log::info;

use crate::command::{run_checked, CommandRunner};
use crate::config::{ContainerRuntime, DeploymentConfig, DockerOrigin};
use crate::error::Result;

/// Distribution package providing the configured runtime.
pub fn runtime_package(config: &DeploymentConfig) -> &'static str {
    match (config.container_runtime, config.docker_origin) {
        (ContainerRuntime::Lxc, _) => "lxc",
        (ContainerRuntime::Docker, DockerOrigin::Distro) => "docker.io",
        (ContainerRuntime::Docker, DockerOrigin::Upstream) => "lxc-docker",
    }
}

/// Makes sure the configured runtime is installed and, for docker, that the
/// login user may talk to the daemon.
pub async fn ensure_runtime(
    runner: &Arc<dyn CommandRunner>,
    config: &DeploymentConfig,
    docker_user: &str,
) -> Result<()> {
    let package = runtime_package(config);
    info!("Ensuring {} runtime package {} is installed", config.container_runtime, package);
    run_checked(runner.as_ref(), &["apt-get", "install", "-qy", package]).await?;

    if config.container_runtime == ContainerRuntime::Docker && !docker_user.is_empty() {
        run_checked(
            runner.as_ref(),
            &["usermod", "-a", "-G", "docker", docker_user],
        )
        .await?;
    }
    Ok(())
}
