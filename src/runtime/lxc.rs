use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use super::{AppliedMarker, ApplyOutcome};
use crate::command::ServiceControl;
use crate::error::Result;
use crate::lease::SubnetLease;
use crate::templates::{write_if_changed, TemplateRenderer, LXC_DEFAULT_CONF, LXC_NET};

/// Substitution fields shared by both lxc templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LxcNetwork {
    pub bridge_name: String,
    pub bridge_addr: String,
    pub netmask: String,
    pub network_cidr: String,
    pub dhcp_start: String,
    pub dhcp_end: String,
    pub dhcp_max: u32,
    pub network_mtu: u32,
}

impl LxcNetwork {
    pub fn from_lease(lease: &SubnetLease, bridge_name: &str) -> Self {
        let subnet = &lease.subnet;
        Self {
            bridge_name: bridge_name.to_string(),
            bridge_addr: subnet.bridge_address().to_string(),
            netmask: subnet.netmask().to_string(),
            network_cidr: subnet.to_string(),
            dhcp_start: subnet.dhcp_start().to_string(),
            dhcp_end: subnet.dhcp_end().to_string(),
            dhcp_max: subnet.dhcp_size(),
            network_mtu: lease.mtu,
        }
    }
}

/// Rewrites the lxc-net defaults and the container default profile, both
/// of which this tool owns outright, then restarts lxc-net when the
/// rendering differs from what it last came up with.
pub struct LxcReconfigurer {
    pub net_path: PathBuf,
    pub conf_path: PathBuf,
    pub bridge: String,
    pub service: String,
    pub marker: AppliedMarker,
    pub services: ServiceControl,
    pub renderer: Arc<TemplateRenderer>,
}

impl LxcReconfigurer {
    pub fn bridge_name(&self) -> &str {
        &self.bridge
    }

    pub async fn apply(&self, lease: &SubnetLease) -> Result<ApplyOutcome> {
        let network = LxcNetwork::from_lease(lease, &self.bridge);
        let net = self.renderer.render(LXC_NET, &network)?;
        let conf = self.renderer.render(LXC_DEFAULT_CONF, &network)?;

        let applied = format!("{net}{conf}");
        let net_changed = write_if_changed(&self.net_path, &net).await?;
        let conf_changed = write_if_changed(&self.conf_path, &conf).await?;
        if !net_changed && !conf_changed && self.marker.matches(&applied).await? {
            info!("LXC already initialized on {}, skipping", network.network_cidr);
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        self.marker.clear().await?;
        self.services.restart(&self.service).await?;
        self.marker.record(&applied).await?;
        info!(
            "LXC initialized: bridge {} at {} range {}-{}",
            network.bridge_name, network.bridge_addr, network.dhcp_start, network.dhcp_end
        );
        Ok(ApplyOutcome::Applied)
    }
}
