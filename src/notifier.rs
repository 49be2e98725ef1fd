use std::sync::Arc;

use log::info;

use crate::error::Result;
use crate::lease::BridgeParameters;
use crate::peer::PeerChannel;

/// Relation capability whose consumers need the bridge parameters.
pub const NETWORK_CAPABILITY: &str = "network";

/// Advertises bridge parameters on every currently established network
/// relation. Republishing unchanged data is harmless to consumers.
pub struct PeerNotifier {
    peers: Arc<dyn PeerChannel>,
    capability: String,
}

impl PeerNotifier {
    pub fn new(peers: Arc<dyn PeerChannel>) -> Self {
        Self {
            peers,
            capability: NETWORK_CAPABILITY.to_string(),
        }
    }

    /// Returns the relation ids that were notified.
    pub async fn notify(&self, params: &BridgeParameters) -> Result<Vec<String>> {
        let ids = self.peers.active_peer_ids(&self.capability).await?;
        let data = params.to_peer_data();
        for id in &ids {
            self.peers.set(Some(id.as_str()), &data).await?;
            info!("Notified {} of bridge {} ({})", id, params.name, params.cidr);
        }
        Ok(ids)
    }
}
