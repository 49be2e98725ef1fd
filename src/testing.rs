//! In-memory stand-ins for the host, the peer channel and the coordination store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner};
use crate::error::{BootstrapError, Result};
use crate::etcd::{CoordinationStore, CreateOutcome};
use crate::peer::{PeerChannel, PeerData};

/// Records every command; succeeds with empty output unless told otherwise.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, argv: &[&str], stdout: &str) {
        self.responses.lock().unwrap().insert(
            argv.join(" "),
            CommandOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    pub fn fail_with(&self, argv: &[&str], code: i32, stderr: &str) {
        self.responses.lock().unwrap().insert(
            argv.join(" "),
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Drop a scripted response so `argv` succeeds again.
    pub fn succeed(&self, argv: &[&str]) {
        self.responses.lock().unwrap().remove(&argv.join(" "));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&line)
            .cloned()
            .unwrap_or(CommandOutput {
                code: Some(0),
                ..Default::default()
            }))
    }
}

/// Peer channel where `set(None, ..)` lands in this unit's own data, the
/// way relation data behaves on a real host.
pub struct FakePeers {
    own_unit: String,
    remote: Mutex<PeerData>,
    units: Mutex<HashMap<String, PeerData>>,
    ids: Mutex<Vec<String>>,
    published: Mutex<Vec<(Option<String>, PeerData)>>,
}

impl FakePeers {
    pub fn new(own_unit: &str) -> Self {
        Self {
            own_unit: own_unit.to_string(),
            remote: Mutex::new(PeerData::new()),
            units: Mutex::new(HashMap::new()),
            ids: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_remote(&self, pairs: &[(&str, &str)]) {
        *self.remote.lock().unwrap() = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn set_ids(&self, ids: &[&str]) {
        *self.ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn own_data(&self) -> PeerData {
        self.units
            .lock()
            .unwrap()
            .get(&self.own_unit)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(Option<String>, PeerData)> {
        self.published.lock().unwrap().clone()
    }

    /// Relation ids that received data, in publish order.
    pub fn published_ids(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .filter_map(|(id, _)| id)
            .collect()
    }
}

#[async_trait]
impl PeerChannel for FakePeers {
    async fn get(&self, unit: Option<&str>) -> Result<PeerData> {
        Ok(match unit {
            None => self.remote.lock().unwrap().clone(),
            Some(unit) => self
                .units
                .lock()
                .unwrap()
                .get(unit)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn set(&self, relation_id: Option<&str>, data: &PeerData) -> Result<()> {
        if relation_id.is_none() {
            self.units
                .lock()
                .unwrap()
                .entry(self.own_unit.clone())
                .or_default()
                .extend(data.clone());
        }
        self.published
            .lock()
            .unwrap()
            .push((relation_id.map(str::to_string), data.clone()));
        Ok(())
    }

    async fn active_peer_ids(&self, _capability: &str) -> Result<Vec<String>> {
        Ok(self.ids.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn seed(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn endpoint(&self) -> String {
        "memory://".into()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn create(&self, key: &str, value: &str) -> Result<CreateOutcome> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BootstrapError::NetworkInit {
                endpoint: self.endpoint(),
                key: key.to_string(),
                reason: "PUT returned 500 Internal Server Error".into(),
            });
        }
        let mut values = self.values.lock().unwrap();
        if values.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        values.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created)
    }
}
