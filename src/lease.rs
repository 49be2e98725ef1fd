//! The overlay daemon's subnet lease and the wait for it to appear.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::cidr::Subnet;
use crate::error::{BootstrapError, Result};
use crate::peer::PeerData;

const SUBNET_KEY: &str = "flannel_subnet";
const MTU_KEY: &str = "flannel_mtu";

/// Subnet and MTU allocated to this host by the overlay daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLease {
    pub subnet: Subnet,
    pub mtu: u32,
}

impl SubnetLease {
    /// Parse `KEY=VALUE` lines; keys are case-insensitive.
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        let malformed = |reason: String| BootstrapError::LeaseParse {
            path: path.to_path_buf(),
            reason,
        };

        let entries: HashMap<String, &str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_lowercase(), v.trim()))
            .collect();

        let subnet: Subnet = entries
            .get(SUBNET_KEY)
            .ok_or_else(|| malformed(format!("missing {SUBNET_KEY}")))?
            .parse()?;
        let mtu = entries
            .get(MTU_KEY)
            .ok_or_else(|| malformed(format!("missing {MTU_KEY}")))?;
        let mtu: u32 = mtu
            .parse()
            .map_err(|_| malformed(format!("{MTU_KEY} {mtu:?} is not an integer")))?;

        Ok(Self { subnet, mtu })
    }

    /// Read the lease at `path`. A missing file is `Ok(None)`.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Self::parse(&contents, path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BootstrapError::io("read lease", path, e)),
        }
    }
}

/// What gets advertised to dependent peers once the bridge is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeParameters {
    pub name: String,
    pub cidr: String,
    pub mtu: u32,
    pub overlay_type: String,
}

impl BridgeParameters {
    pub fn new(lease: &SubnetLease, name: &str, overlay_type: &str) -> Self {
        Self {
            name: name.to_string(),
            cidr: format!(
                "{}/{}",
                lease.subnet.bridge_address(),
                lease.subnet.prefix_len()
            ),
            mtu: lease.mtu,
            overlay_type: overlay_type.to_string(),
        }
    }

    pub fn to_peer_data(&self) -> PeerData {
        PeerData::from([
            ("bridge_name".to_string(), self.name.clone()),
            ("overlay_type".to_string(), self.overlay_type.clone()),
            ("bridge_cidr".to_string(), self.cidr.clone()),
            ("bridge_mtu".to_string(), self.mtu.to_string()),
        ])
    }
}

/// Polls for the lease file until it parses, the timeout passes, or
/// shutdown is signalled.
pub struct LeaseWaiter {
    path: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl LeaseWaiter {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            timeout,
        }
    }

    pub async fn wait(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SubnetLease> {
        let deadline = Instant::now() + self.timeout;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return Err(self.cancelled());
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(self.cancelled());
                    }
                    continue;
                }
            }

            match SubnetLease::read(&self.path).await {
                Ok(Some(lease)) => {
                    info!("Overlay lease available: {} mtu {}", lease.subnet, lease.mtu);
                    return Ok(lease);
                }
                Ok(None) => debug!("No lease at {} yet", self.path.display()),
                Err(e) => warn!("Lease not usable yet: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(BootstrapError::WaitTimeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                });
            }
            info!("Waiting for overlay daemon to publish {}...", self.path.display());
        }
    }

    fn cancelled(&self) -> BootstrapError {
        BootstrapError::Cancelled {
            path: self.path.clone(),
        }
    }
}
