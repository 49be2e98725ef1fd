//! Provisioning of the overlay daemon against the coordination store.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::command::ServiceControl;
use crate::error::{BootstrapError, Result};
use crate::etcd::{CoordinationEndpoint, CoordinationStore, EtcdNetworkInitializer};
use crate::peer::{PeerChannel, PeerData};
use crate::templates::{write_if_changed, TemplateRenderer, OVERLAY_UNIT};

/// Peer data key under which a provisioned unit publishes its endpoint.
pub const ENDPOINT_KEY: &str = "etcd_endpoint";

/// Builds a store client for a freshly discovered endpoint.
pub type StoreFactory =
    Arc<dyn Fn(&CoordinationEndpoint) -> Arc<dyn CoordinationStore> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned(CoordinationEndpoint),
    /// This unit published its endpoint on an earlier run.
    AlreadyPublished(String),
    /// The peer has not published enough to connect to yet.
    NotReady(&'static str),
}

#[derive(Serialize)]
struct UnitTemplate<'a> {
    etcd_endpoint: String,
    etcd_prefix: &'a str,
}

pub struct OverlayConfigWriter {
    pub unit_name: String,
    pub unit_path: PathBuf,
    pub service: String,
    pub initializer: EtcdNetworkInitializer,
    pub etcd_prefix: String,
    pub peers: Arc<dyn PeerChannel>,
    pub services: ServiceControl,
    pub renderer: Arc<TemplateRenderer>,
    pub connect: StoreFactory,
}

impl OverlayConfigWriter {
    /// Point the overlay daemon at the peer's coordination store, once.
    ///
    /// Any failure leaves the endpoint unpublished, so the next event
    /// retries the whole provisioning step.
    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        if self.unit_name.is_empty() {
            return Err(BootstrapError::Config {
                key: "unit_name".into(),
                value: String::new(),
                expected: "this unit's name",
            });
        }

        let own = self.peers.get(Some(self.unit_name.as_str())).await?;
        if let Some(endpoint) = own.get(ENDPOINT_KEY).filter(|e| !e.is_empty()) {
            info!("Endpoint {} already published, skipping overlay provisioning", endpoint);
            return Ok(ProvisionOutcome::AlreadyPublished(endpoint.clone()));
        }

        let remote = self.peers.get(None).await?;
        let endpoint = match CoordinationEndpoint::from_peer(&remote) {
            Ok(endpoint) => endpoint,
            Err(BootstrapError::EndpointNotReady { missing }) => {
                info!("Peer has not published {} yet, nothing to do", missing);
                return Ok(ProvisionOutcome::NotReady(missing));
            }
            Err(e) => return Err(e),
        };
        info!("Provisioning overlay against {}", endpoint);

        let store = (self.connect)(&endpoint);
        self.initializer.initialize(store.as_ref()).await?;

        let unit = self.renderer.render(
            OVERLAY_UNIT,
            &UnitTemplate {
                etcd_endpoint: endpoint.url(),
                etcd_prefix: &self.etcd_prefix,
            },
        )?;
        write_if_changed(&self.unit_path, &unit).await?;
        self.services.restart(&self.service).await?;

        let signal = PeerData::from([(ENDPOINT_KEY.to_string(), endpoint.url())]);
        self.peers.set(None, &signal).await?;
        info!("Published {}={}", ENDPOINT_KEY, endpoint);

        Ok(ProvisionOutcome::Provisioned(endpoint))
    }
}
