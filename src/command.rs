//! External command execution and service control.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::error::{BootstrapError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion. Only a failure to spawn is an `Err`;
    /// a non-zero exit is reported through [`CommandOutput`].
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput>;
}

/// Runs commands on the local host.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| BootstrapError::Command {
            command: String::new(),
            code: None,
            stderr: "empty argv".into(),
        })?;

        debug!("exec: {}", argv.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| BootstrapError::io("spawn", *program, e))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run `argv` and fail with [`BootstrapError::Command`] on a non-zero exit.
/// Returns stdout.
pub async fn run_checked(runner: &dyn CommandRunner, argv: &[&str]) -> Result<String> {
    let output = runner.run(argv).await?;
    if !output.success() {
        return Err(BootstrapError::Command {
            command: argv.join(" "),
            code: output.code,
            stderr: output.stderr,
        });
    }
    Ok(output.stdout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Output fragments the init systems print when asked to stop a service
/// that is not running.
const NOT_RUNNING_MARKERS: &[&str] = &["unknown instance", "not running", "not loaded", "inactive"];

/// `service <name> <action>` wrapper.
#[derive(Clone)]
pub struct ServiceControl {
    runner: Arc<dyn CommandRunner>,
}

impl ServiceControl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn start(&self, service: &str) -> Result<()> {
        self.invoke(service, "start").await.map(|_| ())
    }

    pub async fn restart(&self, service: &str) -> Result<()> {
        self.invoke(service, "restart").await.map(|_| ())
    }

    /// Stop `service`. A service that is already down counts as stopped.
    pub async fn stop(&self, service: &str) -> Result<StopOutcome> {
        match self.invoke(service, "stop").await {
            Ok(_) => Ok(StopOutcome::Stopped),
            Err(BootstrapError::ServiceControl { stderr, .. }) if is_not_running(&stderr) => {
                info!("Service {} already stopped", service);
                Ok(StopOutcome::AlreadyStopped)
            }
            Err(e) => Err(e),
        }
    }

    async fn invoke(&self, service: &str, action: &'static str) -> Result<CommandOutput> {
        info!("service {} {}", service, action);
        let output = self.runner.run(&["service", service, action]).await?;
        if output.success() {
            return Ok(output);
        }

        let detail = if output.stderr.is_empty() {
            output.stdout
        } else {
            output.stderr
        };
        Err(BootstrapError::ServiceControl {
            service: service.to_string(),
            action,
            code: output.code,
            stderr: detail,
        })
    }
}

fn is_not_running(message: &str) -> bool {
    let message = message.to_lowercase();
    NOT_RUNNING_MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    #[tokio::test]
    async fn test_stop_tolerates_already_stopped() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_with(&["service", "docker", "stop"], 1, "stop: Unknown instance: ");
        let services = ServiceControl::new(runner.clone());

        let outcome = services.stop("docker").await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn test_stop_other_failure_is_fatal() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_with(&["service", "docker", "stop"], 1, "permission denied");
        let services = ServiceControl::new(runner.clone());

        let err = services.stop("docker").await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ServiceControl { action: "stop", .. }
        ));
    }

    #[tokio::test]
    async fn test_restart_failure_reports_context() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_with(&["service", "flannel", "restart"], 3, "job failed");
        let services = ServiceControl::new(runner.clone());

        let err = services.restart("flannel").await.unwrap_err().to_string();
        assert!(err.contains("restart flannel"));
        assert!(err.contains("job failed"));
    }

    #[tokio::test]
    async fn test_start_invokes_service_and_reports_failure() {
        let runner = Arc::new(FakeRunner::new());
        let services = ServiceControl::new(runner.clone());
        services.start("lxc-net").await.unwrap();
        assert_eq!(runner.calls(), vec!["service lxc-net start"]);

        runner.fail_with(&["service", "flannel", "start"], 1, "start: Job failed to start");
        let err = services.start("flannel").await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ServiceControl { action: "start", .. }
        ));
    }

    #[tokio::test]
    async fn test_run_checked_returns_stdout() {
        let runner = FakeRunner::new();
        runner.respond(&["relation-ids", "network"], "[\"network:1\"]");
        let out = run_checked(&runner, &["relation-ids", "network"]).await.unwrap();
        assert_eq!(out, "[\"network:1\"]");
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_code() {
        let ok = SystemRunner.run(&["true"]).await.unwrap();
        assert!(ok.success());
        let failed = SystemRunner.run(&["false"]).await.unwrap();
        assert_eq!(failed.code, Some(1));
    }
}
