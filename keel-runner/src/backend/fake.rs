//! In-memory container backend for tests
//!
//! Records every call, keeps created containers and networks in memory and
//! can be told to fail operations, report images as missing, return
//! specific exit codes or block in `wait` until the container is killed.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use super::{ContainerBackend, ContainerInfo, ContainerSpec, ImageInfo, Result};
use crate::error::BackendError;

struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    started: bool,
    exit_code: Option<i64>,
    killed: Arc<Notify>,
}

impl FakeContainer {
    fn command_line(&self) -> String {
        self.spec
            .entrypoint
            .iter()
            .chain(self.spec.cmd.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            labels: self.spec.labels.clone(),
            volumes: self.spec.volumes.clone(),
            running: self.started && self.exit_code.is_none(),
            status: match (self.started, self.exit_code) {
                (false, _) => "created".to_string(),
                (true, None) => "running".to_string(),
                (true, Some(_)) => "exited".to_string(),
            },
            exit_code: self.exit_code,
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, BTreeMap<String, String>>,
    local_images: HashSet<String>,
    missing_images: HashSet<String>,
    image_labels: HashMap<String, BTreeMap<String, String>>,
    flaky_pulls: usize,
    pull_delay: Option<Duration>,
    failing: HashSet<&'static str>,
    exit_codes: Vec<(String, i64)>,
    blocking: Vec<String>,
    output: Vec<(String, String)>,
    created: Vec<ContainerSpec>,
    calls: Vec<String>,
}

impl FakeState {
    fn find(&self, id: &str) -> Option<&FakeContainer> {
        self.containers
            .get(id)
            .or_else(|| self.containers.values().find(|c| c.spec.name == id))
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut FakeContainer> {
        let key = self
            .containers
            .values()
            .find(|c| c.id == id || c.spec.name == id)
            .map(|c| c.id.clone())?;
        self.containers.get_mut(&key)
    }

    fn fail_if(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(BackendError::Unavailable(format!("{} failed: daemon unavailable", op)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    blocked: Notify,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Makes every call of `op` fail with a transient error
    pub fn fail(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    /// The repository does not have this image
    pub fn set_missing_image(&self, name: &str) {
        self.lock().missing_images.insert(name.to_string());
    }

    pub fn set_image_labels(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.lock().image_labels.insert(name.to_string(), labels);
    }

    /// The next `count` pulls fail with a transient error
    pub fn set_flaky_pulls(&self, count: usize) {
        self.lock().flaky_pulls = count;
    }

    /// Every pull takes `delay` before it completes
    pub fn set_pull_delay(&self, delay: Duration) {
        self.lock().pull_delay = Some(delay);
    }

    /// Containers whose command line contains `pattern` exit with `code`
    pub fn set_exit_code(&self, pattern: &str, code: i64) {
        self.lock().exit_codes.push((pattern.to_string(), code));
    }

    /// Containers whose command line contains `pattern` never exit until killed
    pub fn set_blocking(&self, pattern: &str) {
        self.lock().blocking.push(pattern.to_string());
    }

    /// Containers whose command line contains `pattern` print `line`
    pub fn set_output(&self, pattern: &str, line: &str) {
        self.lock()
            .output
            .push((pattern.to_string(), line.to_string()));
    }

    /// Resolves once some container blocks in `wait`
    pub async fn wait_blocked(&self) {
        self.blocked.notified().await;
    }

    /// Adds an already existing container, as if left by an earlier run
    pub fn insert_container(&self, spec: ContainerSpec, exit_code: Option<i64>) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec,
                started: true,
                exit_code,
                killed: Arc::new(Notify::new()),
            },
        );
        id
    }

    pub fn insert_network(&self, name: &str, labels: BTreeMap<String, String>) {
        self.lock().networks.insert(name.to_string(), labels);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of the given operation
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Every container spec ever created
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    /// Containers that still exist
    pub fn live_containers(&self) -> Vec<ContainerInfo> {
        self.lock().containers.values().map(|c| c.info()).collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }
}

fn matches_labels(labels: &BTreeMap<String, String>, filter: &BTreeMap<String, String>) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(format!("create:{}", spec.name));
        state.fail_if("create")?;

        let image = spec.image.strip_prefix("sha256:").unwrap_or(&spec.image);
        if !state.local_images.contains(image) {
            return Err(BackendError::ImageNotFound(format!(
                "No such image: {}",
                spec.image
            )));
        }
        if !spec.name.is_empty() && state.find(&spec.name).is_some() {
            return Err(BackendError::Unavailable(format!(
                "Conflict. The container name \"/{}\" is already in use by container",
                spec.name
            )));
        }

        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                started: false,
                exit_code: None,
                killed: Arc::new(Notify::new()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("start:{}", id));
        state.fail_if("start")?;

        let container = state
            .find_mut(id)
            .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))?;
        container.started = true;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let mut state = self.lock();
        state.calls.push(format!("inspect:{}", id));
        state.fail_if("inspect")?;

        state
            .find(id)
            .map(FakeContainer::info)
            .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let killed = {
            let mut state = self.lock();
            state.calls.push(format!("wait:{}", id));
            state.fail_if("wait")?;

            let blocking = state.blocking.clone();
            let exit_codes = state.exit_codes.clone();
            let container = state
                .find_mut(id)
                .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))?;
            let command_line = container.command_line();

            if blocking.iter().any(|p| command_line.contains(p.as_str())) {
                container.killed.clone()
            } else {
                let code = exit_codes
                    .iter()
                    .find(|(p, _)| command_line.contains(p.as_str()))
                    .map(|(_, code)| *code)
                    .unwrap_or(0);
                container.exit_code = Some(code);
                return Ok(code);
            }
        };

        self.blocked.notify_one();
        killed.notified().await;
        Ok(137)
    }

    async fn follow_logs(&self, id: &str, lines: UnboundedSender<String>) -> Result<()> {
        let output = {
            let mut state = self.lock();
            state.calls.push(format!("logs:{}", id));
            let command_line = state.find(id).map(|c| c.command_line()).unwrap_or_default();
            state
                .output
                .iter()
                .filter(|(p, _)| command_line.contains(p.as_str()))
                .map(|(_, line)| line.clone())
                .collect::<Vec<_>>()
        };

        for line in output {
            let _ = lines.send(line);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("kill:{}", id));

        let container = state
            .find_mut(id)
            .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))?;
        container.exit_code = Some(137);
        container.killed.notify_one();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove:{}", id));
        state.fail_if("remove")?;

        let key = state
            .find(id)
            .map(|c| c.id.clone())
            .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))?;
        if let Some(container) = state.containers.remove(&key) {
            container.killed.notify_one();
        }
        Ok(())
    }

    async fn list_containers(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push("list:containers".to_string());
        Ok(state
            .containers
            .values()
            .filter(|c| matches_labels(&c.spec.labels, labels))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(format!("network-create:{}", name));
        state.fail_if("network-create")?;
        state.networks.insert(name.to_string(), labels.clone());
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("network-remove:{}", id));
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchObject(id.to_string()))
    }

    async fn list_networks(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push("list:networks".to_string());
        Ok(state
            .networks
            .iter()
            .filter(|(_, l)| matches_labels(l, labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(format!("pull:{}", name));
            state.pull_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.fail_if("pull")?;

        if state.flaky_pulls > 0 {
            state.flaky_pulls -= 1;
            return Err(BackendError::Unavailable("TLS handshake timeout".to_string()));
        }
        if state.missing_images.contains(name) {
            return Err(BackendError::ImageNotFound(format!(
                "manifest for {} not found: manifest unknown",
                name
            )));
        }
        state.local_images.insert(name.to_string());
        Ok(())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageInfo> {
        let mut state = self.lock();
        state.calls.push(format!("image-inspect:{}", name));

        if !state.local_images.contains(name) {
            return Err(BackendError::ImageNotFound(format!("No such image: {}", name)));
        }
        Ok(ImageInfo {
            id: format!("sha256:{}", name),
            labels: state.image_labels.get(name).cloned().unwrap_or_default(),
        })
    }
}
