//! Coordination store access and overlay network registration.

use std::fmt;

use async_trait::async_trait;
use log::info;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::cidr::Subnet;
use crate::error::{BootstrapError, Result};
use crate::peer::PeerData;

/// Where the coordination store listens, as discovered from peer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl CoordinationEndpoint {
    /// Build the endpoint from a peer's published `hostname` and `port`.
    pub fn from_peer(data: &PeerData) -> Result<Self> {
        let port = data
            .get("port")
            .ok_or(BootstrapError::EndpointNotReady { missing: "port" })?;
        let host = data
            .get("hostname")
            .filter(|h| !h.is_empty())
            .ok_or(BootstrapError::EndpointNotReady {
                missing: "hostname",
            })?;
        let port: u16 = port.trim().parse().map_err(|_| BootstrapError::Peer {
            operation: "endpoint discovery",
            reason: format!("port {port:?} is not a valid port number"),
        })?;

        Ok(Self {
            scheme: "http".into(),
            host: host.clone(),
            port,
        })
    }

    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CoordinationEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn endpoint(&self) -> String;

    /// Current value at `key`, `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Create `key` only if it does not exist yet.
    async fn create(&self, key: &str, value: &str) -> Result<CreateOutcome>;
}

/// etcd v2 keys API client.
pub struct EtcdClient {
    client: Client,
    endpoint: CoordinationEndpoint,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    node: Option<KeyNode>,
}

#[derive(Debug, Deserialize)]
struct KeyNode {
    value: Option<String>,
}

impl EtcdClient {
    pub fn new(endpoint: CoordinationEndpoint) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    fn failure(&self, key: &str, reason: impl Into<String>) -> BootstrapError {
        BootstrapError::NetworkInit {
            endpoint: self.endpoint.url(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdClient {
    fn endpoint(&self) -> String {
        self.endpoint.url()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| self.failure(key, format!("GET failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.failure(key, format!("GET returned {status}: {body}")));
        }

        let parsed: KeyResponse = response
            .json()
            .await
            .map_err(|e| self.failure(key, format!("undecodable GET response: {e}")))?;
        Ok(parsed.node.and_then(|n| n.value))
    }

    async fn create(&self, key: &str, value: &str) -> Result<CreateOutcome> {
        let response = self
            .client
            .put(self.key_url(key))
            .query(&[("prevExist", "false")])
            .form(&[("value", value)])
            .send()
            .await
            .map_err(|e| self.failure(key, format!("PUT failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!("etcd PUT {} -> {} {}", key, status, body);

        match status {
            s if s.is_success() => Ok(CreateOutcome::Created),
            StatusCode::PRECONDITION_FAILED => Ok(CreateOutcome::AlreadyExists),
            s => Err(self.failure(key, format!("PUT returned {s}: {body}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkInitOutcome {
    Initialized,
    AlreadyInitialized,
}

/// Registers `{"Network": <cidr>}` under `<prefix>/config` unless a network
/// specification is already present there.
pub struct EtcdNetworkInitializer {
    prefix: String,
    network: String,
}

impl EtcdNetworkInitializer {
    pub fn new(prefix: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            network: network.into(),
        }
    }

    pub fn config_key(&self) -> String {
        format!("{}/config", self.prefix.trim_end_matches('/'))
    }

    pub async fn initialize(&self, store: &dyn CoordinationStore) -> Result<NetworkInitOutcome> {
        let network: Subnet = self.network.parse()?;
        let key = self.config_key();

        if let Some(existing) = store.get(&key).await? {
            info!(
                "Overlay network already registered at {}{}: {}",
                store.endpoint(),
                key,
                existing
            );
            return Ok(NetworkInitOutcome::AlreadyInitialized);
        }

        let value = serde_json::json!({ "Network": network.to_string() }).to_string();
        match store.create(&key, &value).await? {
            CreateOutcome::Created => {
                info!("Registered overlay network {} at {}{}", network, store.endpoint(), key);
                Ok(NetworkInitOutcome::Initialized)
            }
            CreateOutcome::AlreadyExists => {
                info!("Overlay network registered concurrently at {}", key);
                Ok(NetworkInitOutcome::AlreadyInitialized)
            }
        }
    }
}
