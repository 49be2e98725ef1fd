//! Sequencing of the bootstrap steps for each inbound event.
//!
//! The host agent delivers one event at a time; an [`Orchestrator`] runs
//! that event to completion or failure before the next one arrives. Only
//! the runtime reconfiguration step guards itself with a host-wide lock.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::cidr::Subnet;
use crate::command::{CommandRunner, ServiceControl};
use crate::config::{ConfigStore, DeploymentConfig, Settings};
use crate::error::Result;
use crate::etcd::EtcdNetworkInitializer;
use crate::install;
use crate::lease::{BridgeParameters, LeaseWaiter, SubnetLease};
use crate::lock::ApplyLock;
use crate::notifier::PeerNotifier;
use crate::overlay::{OverlayConfigWriter, ProvisionOutcome, StoreFactory};
use crate::peer::PeerChannel;
use crate::runtime::{ApplyOutcome, RuntimeReconfigurer};
use crate::templates::TemplateRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    EndpointPending,
    LeaseWaiting,
    RuntimeApplying,
    Notifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Deployment configuration changed.
    ConfigChanged,
    /// The coordination store's peer published or updated its data.
    PeerDataChanged,
    /// A dependent peer joined or changed on the network relation.
    NetworkPeersChanged,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::ConfigChanged => "config-changed",
            Event::PeerDataChanged => "peer-data-changed",
            Event::NetworkPeersChanged => "network-peers-changed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    RuntimeInstalled,
    Skipped(&'static str),
    Configured {
        bridge: BridgeParameters,
        runtime: ApplyOutcome,
        notified: Vec<String>,
    },
    Notified(Vec<String>),
}

pub struct Orchestrator {
    settings: Settings,
    config: Arc<dyn ConfigStore>,
    runner: Arc<dyn CommandRunner>,
    peers: Arc<dyn PeerChannel>,
    connect: StoreFactory,
    renderer: Arc<TemplateRenderer>,
    shutdown: watch::Receiver<bool>,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        config: Arc<dyn ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        peers: Arc<dyn PeerChannel>,
        connect: StoreFactory,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Ok(Self {
            settings,
            config,
            runner,
            peers,
            connect,
            renderer: Arc::new(TemplateRenderer::embedded()?),
            shutdown,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run `event` to completion. Any error returns the machine to
    /// [`Phase::Idle`]; re-delivering the event is always safe.
    pub async fn handle(&mut self, event: Event) -> Result<RunOutcome> {
        info!("Handling {}", event);
        let result = match event {
            Event::ConfigChanged => self.config_changed().await,
            Event::PeerDataChanged => self.peer_data_changed().await,
            Event::NetworkPeersChanged => self.network_peers_changed().await,
        };
        self.enter(Phase::Idle);
        result
    }

    async fn config_changed(&mut self) -> Result<RunOutcome> {
        let deployment = DeploymentConfig::read(self.config.as_ref())?;
        install::ensure_runtime(&self.runner, &deployment, &self.settings.docker_user).await?;
        Ok(RunOutcome::RuntimeInstalled)
    }

    async fn peer_data_changed(&mut self) -> Result<RunOutcome> {
        let deployment = DeploymentConfig::read(self.config.as_ref())?;
        let runtime = self.runtime_for(&deployment);

        self.enter(Phase::EndpointPending);
        if let ProvisionOutcome::NotReady(_) = self.overlay_writer().provision().await? {
            return Ok(RunOutcome::Skipped("coordination endpoint not published yet"));
        }

        self.enter(Phase::LeaseWaiting);
        let waiter = LeaseWaiter::new(
            &self.settings.lease_path,
            self.settings.lease_poll_interval(),
            self.settings.lease_timeout(),
        );
        let lease = waiter.wait(&mut self.shutdown).await?;
        if let Ok(overlay) = self.settings.overlay_network.parse::<Subnet>() {
            if !overlay.contains(lease.subnet.network()) {
                warn!(
                    "Leased subnet {} lies outside overlay network {}; the store may hold a different network config",
                    lease.subnet, overlay
                );
            }
        }

        self.enter(Phase::RuntimeApplying);
        let applied = {
            let _lock = ApplyLock::acquire(&self.settings.lock_path).await?;
            runtime.apply(&lease).await?
        };

        self.enter(Phase::Notifying);
        let bridge = BridgeParameters::new(&lease, runtime.bridge_name(), &self.settings.overlay_type);
        let notified = PeerNotifier::new(self.peers.clone()).notify(&bridge).await?;

        Ok(RunOutcome::Configured {
            bridge,
            runtime: applied,
            notified,
        })
    }

    /// Re-advertise the current bridge without waiting for a lease.
    async fn network_peers_changed(&mut self) -> Result<RunOutcome> {
        let deployment = DeploymentConfig::read(self.config.as_ref())?;
        let Some(lease) = SubnetLease::read(&self.settings.lease_path).await? else {
            return Ok(RunOutcome::Skipped("overlay lease not available yet"));
        };

        self.enter(Phase::Notifying);
        let runtime = self.runtime_for(&deployment);
        let bridge = BridgeParameters::new(&lease, runtime.bridge_name(), &self.settings.overlay_type);
        let notified = PeerNotifier::new(self.peers.clone()).notify(&bridge).await?;
        Ok(RunOutcome::Notified(notified))
    }

    fn runtime_for(&self, deployment: &DeploymentConfig) -> RuntimeReconfigurer {
        RuntimeReconfigurer::for_config(
            deployment,
            &self.settings,
            self.runner.clone(),
            self.renderer.clone(),
        )
    }

    fn overlay_writer(&self) -> OverlayConfigWriter {
        OverlayConfigWriter {
            unit_name: self.settings.unit_name.clone(),
            unit_path: self.settings.overlay_unit_path.clone(),
            service: self.settings.overlay_service.clone(),
            initializer: EtcdNetworkInitializer::new(
                self.settings.etcd_prefix.clone(),
                self.settings.overlay_network.clone(),
            ),
            etcd_prefix: self.settings.etcd_prefix.clone(),
            peers: self.peers.clone(),
            services: ServiceControl::new(self.runner.clone()),
            renderer: self.renderer.clone(),
            connect: self.connect.clone(),
        }
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            debug!("{:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CONTAINER_TYPE_KEY, DOCKER_ORIGIN_KEY};
    use crate::error::BootstrapError;
    use crate::etcd::{CoordinationEndpoint, CoordinationStore};
    use crate::overlay::ENDPOINT_KEY;
    use crate::testing::{FakePeers, FakeRunner, MemoryStore};
    use std::collections::HashMap;
    use std::path::Path;

    const LEASE: &str = "FLANNEL_NETWORK=10.10.0.0/16\nFLANNEL_SUBNET=10.10.5.1/24\nFLANNEL_MTU=1472\n";

    struct Harness {
        dir: tempfile::TempDir,
        runner: Arc<FakeRunner>,
        peers: Arc<FakePeers>,
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
        _shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn new(runtime: &str) -> Self {
            Self::with_origin(runtime, "distro")
        }

        fn with_origin(runtime: &str, origin: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            let settings = Settings {
                unit_name: "flannel/0".into(),
                lease_path: root.join("run/flannel/subnet.env"),
                lease_timeout_secs: 0,
                overlay_unit_path: root.join("etc/init/flannel.conf"),
                lxc_net_path: root.join("etc/default/lxc-net"),
                lxc_conf_path: root.join("etc/lxc/default.conf"),
                defaults_dir: root.join("etc/default"),
                lock_path: root.join("flannel-glue.lock"),
                state_dir: root.join("var/lib/flannel-glue"),
                ..Settings::default()
            };
            std::fs::create_dir_all(&settings.defaults_dir).unwrap();

            let config: HashMap<String, String> = HashMap::from([
                (CONTAINER_TYPE_KEY.to_string(), runtime.to_string()),
                (DOCKER_ORIGIN_KEY.to_string(), origin.to_string()),
            ]);
            let runner = Arc::new(FakeRunner::new());
            let peers = Arc::new(FakePeers::new("flannel/0"));
            let store = Arc::new(MemoryStore::default());
            let connect_store = store.clone();
            let (tx, rx) = watch::channel(false);

            let orchestrator = Orchestrator::new(
                settings,
                Arc::new(config),
                runner.clone(),
                peers.clone(),
                Arc::new(move |_: &CoordinationEndpoint| {
                    connect_store.clone() as Arc<dyn CoordinationStore>
                }),
                rx,
            )
            .unwrap();

            Self {
                dir,
                runner,
                peers,
                store,
                orchestrator,
                _shutdown: tx,
            }
        }

        fn path(&self, rel: &str) -> std::path::PathBuf {
            self.dir.path().join(rel)
        }

        fn publish_lease(&self) {
            let path = self.path("run/flannel/subnet.env");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, LEASE).unwrap();
        }

        fn peer_ready(&self) {
            self.peers
                .set_remote(&[("hostname", "10.0.0.4"), ("port", "4001")]);
            self.peers.set_ids(&["network:2"]);
        }
    }

    fn exists(path: &Path) -> bool {
        path.exists()
    }

    #[tokio::test]
    async fn test_docker_end_to_end() {
        let mut h = Harness::new("docker");
        h.peer_ready();
        h.publish_lease();

        let outcome = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();
        match outcome {
            RunOutcome::Configured {
                bridge,
                runtime,
                notified,
            } => {
                assert_eq!(bridge.name, "docker0");
                assert_eq!(bridge.cidr, "10.10.5.1/24");
                assert_eq!(runtime, ApplyOutcome::Applied);
                assert_eq!(notified, vec!["network:2"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.orchestrator.phase(), Phase::Idle);

        let env = std::fs::read_to_string(h.path("etc/default/docker.io")).unwrap();
        assert!(env.contains("--bip=10.10.5.1 --mtu=1472"));
        assert_eq!(h.runner.count("service flannel restart"), 1);
        assert_eq!(h.runner.count("service docker.io restart"), 1);
        assert_eq!(
            h.peers.own_data().get(ENDPOINT_KEY).map(String::as_str),
            Some("http://10.0.0.4:4001")
        );
        assert!(!exists(&h.path("flannel-glue.lock")));
    }

    #[tokio::test]
    async fn test_redelivered_event_is_idempotent() {
        let mut h = Harness::new("docker");
        h.peer_ready();
        h.publish_lease();

        h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();
        let again = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();

        assert!(matches!(
            again,
            RunOutcome::Configured {
                runtime: ApplyOutcome::AlreadyApplied,
                ..
            }
        ));
        assert_eq!(h.runner.count("service flannel restart"), 1);
        assert_eq!(h.runner.count("service docker.io restart"), 1);
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_lxc_end_to_end() {
        let mut h = Harness::new("lxc");
        h.peer_ready();
        h.publish_lease();

        let outcome = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Configured { ref bridge, .. } if bridge.name == "lxcbr0"));

        let net = std::fs::read_to_string(h.path("etc/default/lxc-net")).unwrap();
        assert!(net.contains("LXC_ADDR=\"10.10.5.1\""));
        assert!(net.contains("LXC_DHCP_RANGE=\"10.10.5.2,10.10.5.254\""));
        assert!(net.contains("LXC_NETWORK=\"10.10.5.0/24\""));
        assert_eq!(h.runner.count("service lxc-net restart"), 1);
        assert_eq!(h.runner.count("service docker.io restart"), 0);
    }

    #[tokio::test]
    async fn test_missing_port_does_nothing() {
        let mut h = Harness::new("docker");
        h.peers.set_remote(&[("hostname", "10.0.0.4")]);

        let outcome = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped(_)));
        assert!(h.runner.calls().is_empty());
        assert!(h.peers.published().is_empty());
        assert!(!exists(&h.path("etc/init/flannel.conf")));
        assert!(!exists(&h.path("etc/default/docker.io")));
    }

    #[tokio::test]
    async fn test_invalid_runtime_fails_before_any_mutation() {
        for (runtime, origin, key) in [
            ("kvm", "distro", CONTAINER_TYPE_KEY),
            ("docker", "ppa", DOCKER_ORIGIN_KEY),
        ] {
            let mut h = Harness::with_origin(runtime, origin);
            h.peer_ready();
            h.publish_lease();

            for event in [Event::ConfigChanged, Event::PeerDataChanged, Event::NetworkPeersChanged] {
                let err = h.orchestrator.handle(event).await.unwrap_err();
                assert!(
                    matches!(err, BootstrapError::Config { key: ref k, .. } if k == key),
                    "{runtime}/{origin} {event}: {err}"
                );
            }
            assert!(h.runner.calls().is_empty());
            assert!(h.peers.published().is_empty());
            assert_eq!(h.store.writes(), 0);
            assert!(!exists(&h.path("etc/init/flannel.conf")));
            assert!(!exists(&h.path("etc/default/docker.io")));
            assert!(!exists(&h.path("var/lib/flannel-glue")));
        }
    }

    #[tokio::test]
    async fn test_lease_timeout_skips_runtime_and_notification() {
        let mut h = Harness::new("docker");
        h.peer_ready();

        let err = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap_err();
        assert!(matches!(err, BootstrapError::WaitTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
        assert_eq!(h.runner.count("service docker.io restart"), 0);
        assert!(h.peers.published_ids().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_failure_suppresses_notification() {
        let mut h = Harness::new("docker");
        h.peer_ready();
        h.publish_lease();
        h.runner
            .fail_with(&["service", "docker.io", "restart"], 1, "docker: start failed");

        let err = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap_err();
        assert!(matches!(err, BootstrapError::ServiceControl { .. }));
        assert!(h.peers.published_ids().is_empty());
        assert!(!exists(&h.path("flannel-glue.lock")));
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_restart_restarts_before_notifying() {
        let mut h = Harness::new("docker");
        h.peer_ready();
        h.publish_lease();
        h.runner
            .fail_with(&["service", "docker.io", "restart"], 1, "docker: start failed");

        h.orchestrator.handle(Event::PeerDataChanged).await.unwrap_err();
        assert!(h.peers.published_ids().is_empty());

        h.runner.succeed(&["service", "docker.io", "restart"]);
        let outcome = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Configured {
                runtime: ApplyOutcome::Applied,
                ..
            }
        ));
        assert_eq!(h.runner.count("service docker.io restart"), 2);
        assert_eq!(h.peers.published_ids(), vec!["network:2"]);
    }

    #[tokio::test]
    async fn test_held_lock_is_busy() {
        let mut h = Harness::new("docker");
        h.peer_ready();
        h.publish_lease();
        let _held = ApplyLock::acquire(&h.path("flannel-glue.lock")).await.unwrap();

        let err = h.orchestrator.handle(Event::PeerDataChanged).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Busy { .. }));
        assert_eq!(h.runner.count("service docker.io stop"), 0);
    }

    #[tokio::test]
    async fn test_network_event_notifies_from_existing_lease() {
        let mut h = Harness::new("docker");
        h.peers.set_ids(&["network:5", "network:6"]);

        let skipped = h.orchestrator.handle(Event::NetworkPeersChanged).await.unwrap();
        assert!(matches!(skipped, RunOutcome::Skipped(_)));

        h.publish_lease();
        let outcome = h.orchestrator.handle(Event::NetworkPeersChanged).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Notified(vec!["network:5".into(), "network:6".into()])
        );
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_config_changed_installs_runtime() {
        let mut h = Harness::new("docker");
        let outcome = h.orchestrator.handle(Event::ConfigChanged).await.unwrap();
        assert_eq!(outcome, RunOutcome::RuntimeInstalled);
        assert_eq!(h.runner.count("apt-get install -qy docker.io"), 1);
    }
}
