//! Key-value exchange with cooperating hosts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::command::{run_checked, CommandRunner};
use crate::error::{BootstrapError, Result};

pub type PeerData = BTreeMap<String, String>;

#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Data published on the current relation by the remote side, or by
    /// `unit` when given.
    async fn get(&self, unit: Option<&str>) -> Result<PeerData>;

    /// Publish `data` on relation `relation_id`, or on the current relation.
    async fn set(&self, relation_id: Option<&str>, data: &PeerData) -> Result<()>;

    /// Ids of every relation currently established for `capability`.
    async fn active_peer_ids(&self, capability: &str) -> Result<Vec<String>>;
}

/// [`PeerChannel`] backed by the orchestration agent's relation tools.
pub struct RelationChannel {
    runner: Arc<dyn CommandRunner>,
}

impl RelationChannel {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PeerChannel for RelationChannel {
    async fn get(&self, unit: Option<&str>) -> Result<PeerData> {
        let mut argv = vec!["relation-get", "--format=json"];
        if let Some(unit) = unit {
            argv.extend(["-", unit]);
        }
        let raw = run_checked(self.runner.as_ref(), &argv).await?;
        parse_peer_data(&raw)
    }

    async fn set(&self, relation_id: Option<&str>, data: &PeerData) -> Result<()> {
        let pairs: Vec<String> = data.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut argv = vec!["relation-set"];
        if let Some(id) = relation_id {
            argv.extend(["-r", id]);
        }
        argv.extend(pairs.iter().map(String::as_str));
        run_checked(self.runner.as_ref(), &argv).await?;
        Ok(())
    }

    async fn active_peer_ids(&self, capability: &str) -> Result<Vec<String>> {
        let raw = run_checked(
            self.runner.as_ref(),
            &["relation-ids", "--format=json", capability],
        )
        .await?;
        if raw.trim().is_empty() || raw.trim() == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| BootstrapError::Peer {
            operation: "relation-ids",
            reason: format!("{e}: {raw}"),
        })
    }
}

/// Relation data arrives as a JSON object; non-string values are kept in
/// their JSON text form.
fn parse_peer_data(raw: &str) -> Result<PeerData> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return Ok(PeerData::new());
    }

    let object: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| BootstrapError::Peer {
            operation: "relation-get",
            reason: format!("{e}: {raw}"),
        })?;
    debug!("relation data keys: {:?}", object.keys().collect::<Vec<_>>());

    Ok(object
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((k, s)),
            other => Some((k, other.to_string())),
        })
        .collect())
}
