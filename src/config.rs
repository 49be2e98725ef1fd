use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, Result};

pub const CONTAINER_TYPE_KEY: &str = "container_type";
pub const DOCKER_ORIGIN_KEY: &str = "docker_origin";

/// Read access to deployment configuration values.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Host paths, service names and tunables. Every field has a default so a
/// bare host needs no config file at all.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub container_type: String,
    pub docker_origin: String,
    /// Identity under which this unit's own peer data is stored.
    pub unit_name: String,
    pub lease_path: PathBuf,
    pub lease_timeout_secs: u64,
    pub lease_poll_interval_secs: u64,
    pub etcd_prefix: String,
    pub overlay_network: String,
    pub overlay_service: String,
    pub overlay_unit_path: PathBuf,
    pub lxc_net_path: PathBuf,
    pub lxc_conf_path: PathBuf,
    pub lxc_service: String,
    /// Directory holding the docker daemon's environment file.
    pub defaults_dir: PathBuf,
    pub bridge_name: String,
    pub lxc_bridge: String,
    pub overlay_type: String,
    pub docker_user: String,
    pub lock_path: PathBuf,
    /// Where each runtime records the configuration it was last restarted with.
    pub state_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            container_type: "docker".into(),
            docker_origin: "distro".into(),
            unit_name: String::new(),
            lease_path: "/run/flannel/subnet.env".into(),
            lease_timeout_secs: 120,
            lease_poll_interval_secs: 2,
            etcd_prefix: "/coreos.com/network".into(),
            overlay_network: "10.10.0.0/16".into(),
            overlay_service: "flannel".into(),
            overlay_unit_path: "/etc/init/flannel.conf".into(),
            lxc_net_path: "/etc/default/lxc-net".into(),
            lxc_conf_path: "/etc/lxc/default.conf".into(),
            lxc_service: "lxc-net".into(),
            defaults_dir: "/etc/default".into(),
            bridge_name: "docker0".into(),
            lxc_bridge: "lxcbr0".into(),
            overlay_type: "udp".into(),
            docker_user: "ubuntu".into(),
            lock_path: "/run/flannel-glue.lock".into(),
            state_dir: "/var/lib/flannel-glue".into(),
        }
    }
}

impl Settings {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lease_poll_interval_secs.max(1))
    }
}

/// Layered configuration: defaults, then TOML, then JSON, then the agent's
/// `JUJU_UNIT_NAME`, then `FLANNEL_GLUE_*` environment variables.
pub struct FigmentStore {
    figment: Figment,
}

impl FigmentStore {
    pub fn load(config_path: Option<&Path>) -> Self {
        let toml = config_path.unwrap_or_else(|| Path::new("flannel-glue.toml"));
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(toml))
            .merge(Json::file("flannel-glue.json"))
            .merge(Env::raw().only(&["JUJU_UNIT_NAME"]).map(|_| "unit_name".into()))
            .merge(Env::prefixed("FLANNEL_GLUE_"));
        Self { figment }
    }

    pub fn settings(&self) -> anyhow::Result<Settings> {
        self.figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }
}

impl ConfigStore for FigmentStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.figment.extract_inner::<serde_json::Value>(key).ok()? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Lxc,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerOrigin {
    Upstream,
    Distro,
}

impl DockerOrigin {
    /// Package, service and `/etc/default` file name for this origin.
    pub fn service_name(self) -> &'static str {
        match self {
            DockerOrigin::Upstream => "docker",
            DockerOrigin::Distro => "docker.io",
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerRuntime::Lxc => "lxc",
            ContainerRuntime::Docker => "docker",
        })
    }
}

/// Validated per-event deployment choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub container_runtime: ContainerRuntime,
    pub docker_origin: DockerOrigin,
}

impl DeploymentConfig {
    /// Reads and validates both enum values. Nothing on the host is touched
    /// before this succeeds.
    pub fn read(store: &dyn ConfigStore) -> Result<Self> {
        let runtime = store.get(CONTAINER_TYPE_KEY).unwrap_or_default();
        let container_runtime = match runtime.as_str() {
            "lxc" => ContainerRuntime::Lxc,
            "docker" => ContainerRuntime::Docker,
            _ => {
                return Err(BootstrapError::Config {
                    key: CONTAINER_TYPE_KEY.into(),
                    value: runtime,
                    expected: "lxc, docker",
                })
            }
        };

        let origin = store.get(DOCKER_ORIGIN_KEY).unwrap_or_default();
        let docker_origin = match origin.as_str() {
            "upstream" => DockerOrigin::Upstream,
            "distro" => DockerOrigin::Distro,
            _ => {
                return Err(BootstrapError::Config {
                    key: DOCKER_ORIGIN_KEY.into(),
                    value: origin,
                    expected: "upstream, distro",
                })
            }
        };

        Ok(Self {
            container_runtime,
            docker_origin,
        })
    }
}
