//! Podman/Docker CLI backend
//!
//! Drives the container runtime through its command line client:
//! - Checking runtime availability
//! - Container create/start/inspect/wait/kill/remove
//! - Streaming container output
//! - Network and image operations
//!
//! Every invocation is spawned with `kill_on_drop`, so dropping an in-flight
//! call (e.g. on cancellation) also terminates the client process.

use async_trait::async_trait;
use keel_core::domain::runner::BackendKind;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::{ContainerBackend, ContainerInfo, ContainerSpec, ImageInfo, Result};
use crate::error::BackendError;

/// What a failing command was operating on, for error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Container,
    Network,
    Image,
}

/// Container backend driving the podman or docker CLI
#[derive(Debug, Clone)]
pub struct CliBackend {
    kind: BackendKind,
    host: Option<String>,
}

impl CliBackend {
    /// Creates a backend for the given runtime
    ///
    /// # Arguments
    /// * `kind` - Which CLI to drive
    /// * `host` - Remote endpoint, local daemon when `None`
    pub fn new(kind: BackendKind, host: Option<String>) -> Self {
        Self { kind, host }
    }

    /// Checks that the runtime CLI is installed and answers
    pub async fn check_available(&self) -> Result<String> {
        let version = self.run(Subject::Container, ["--version"]).await?;
        info!("Container runtime is available: {}", version);
        Ok(version)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.kind.program());
        if let Some(host) = &self.host {
            match self.kind {
                BackendKind::Docker => command.arg("--host").arg(host),
                BackendKind::Podman => command.arg("--url").arg(host),
            };
        }
        command.kill_on_drop(true);
        command
    }

    /// Runs a CLI command to completion and returns trimmed stdout
    async fn run<I, S>(&self, subject: Subject, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = self.command();
        command.args(args);
        command.stdin(Stdio::null());

        let output = command.output().await.map_err(|e| {
            BackendError::Unavailable(format!(
                "failed to execute '{}': {}",
                self.kind.program(),
                e
            ))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !stderr.is_empty() {
            debug!("{} stderr: {}", self.kind.program(), stderr);
        }

        if !output.status.success() {
            return Err(classify(subject, &stderr));
        }

        Ok(stdout)
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if !spec.name.is_empty() {
            args.push("--name".to_string());
            args.push(spec.name.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for path in spec.volumes.iter().chain(spec.binds.iter()) {
            args.push("--volume".to_string());
            args.push(path.clone());
        }
        for source in &spec.volumes_from {
            args.push("--volumes-from".to_string());
            args.push(source.clone());
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
            for alias in &spec.network_aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(cpus) = &spec.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.clone());
        }
        if let Some(memory) = &spec.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(dir) = &spec.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.clone());
        }

        // The CLI takes a single entrypoint binary; the rest of the
        // entrypoint goes in front of the command.
        let mut entrypoint = spec.entrypoint.iter();
        if let Some(binary) = entrypoint.next() {
            args.push("--entrypoint".to_string());
            args.push(binary.clone());
        }

        args.push(spec.image.clone());
        args.extend(entrypoint.cloned());
        args.extend(spec.cmd.iter().cloned());
        args
    }

    fn filter_args(labels: &BTreeMap<String, String>) -> Vec<String> {
        labels
            .iter()
            .flat_map(|(k, v)| ["--filter".to_string(), format!("label={}={}", k, v)])
            .collect()
    }
}

/// Maps CLI stderr onto the backend error taxonomy
fn classify(subject: Subject, stderr: &str) -> BackendError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("invalid reference format") || lower.contains("invalid argument") {
        return BackendError::Rejected(stderr.to_string());
    }

    match subject {
        Subject::Image => {
            const MISSING: [&str; 7] = [
                "manifest unknown",
                "repository does not exist",
                "pull access denied",
                "name unknown",
                "no such image",
                "image not known",
                "not found",
            ];
            if MISSING.iter().any(|m| lower.contains(m)) {
                return BackendError::ImageNotFound(stderr.to_string());
            }
        }
        Subject::Container | Subject::Network => {
            // create fails on a missing local image, which is a content error
            if lower.contains("no such image") || lower.contains("image not known") {
                return BackendError::ImageNotFound(stderr.to_string());
            }
            const MISSING: [&str; 5] = [
                "no such container",
                "no such object",
                "no container with name or id",
                "no such network",
                "network not found",
            ];
            if MISSING.iter().any(|m| lower.contains(m)) {
                return BackendError::NoSuchObject(stderr.to_string());
            }
        }
    }

    BackendError::Unavailable(stderr.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedContainer {
    id: String,
    name: String,
    config: InspectedConfig,
    state: InspectedState,
    mounts: Option<Vec<InspectedMount>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedConfig {
    labels: Option<BTreeMap<String, String>>,
    volumes: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedState {
    status: String,
    running: bool,
    exit_code: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedMount {
    destination: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedImage {
    id: String,
    config: InspectedConfig,
    labels: Option<BTreeMap<String, String>>,
}

fn parse_inspect<T: serde::de::DeserializeOwned + Default>(
    subject: Subject,
    output: &str,
) -> Result<T> {
    let mut items: Vec<T> = serde_json::from_str(output).map_err(|e| {
        BackendError::Unavailable(format!("failed to parse inspect output: {}", e))
    })?;

    if items.is_empty() {
        return Err(match subject {
            Subject::Image => BackendError::ImageNotFound("empty inspect output".to_string()),
            _ => BackendError::NoSuchObject("empty inspect output".to_string()),
        });
    }
    Ok(items.swap_remove(0))
}

impl From<InspectedContainer> for ContainerInfo {
    fn from(inspected: InspectedContainer) -> Self {
        let mut volumes: Vec<String> = inspected
            .config
            .volumes
            .unwrap_or_default()
            .into_keys()
            .collect();
        for mount in inspected.mounts.unwrap_or_default() {
            if !volumes.contains(&mount.destination) {
                volumes.push(mount.destination);
            }
        }

        ContainerInfo {
            id: inspected.id,
            name: inspected.name.trim_start_matches('/').to_string(),
            labels: inspected.config.labels.unwrap_or_default(),
            volumes,
            running: inspected.state.running,
            status: inspected.state.status,
            exit_code: inspected.state.exit_code,
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, lines: UnboundedSender<String>) {
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if lines.send(line).is_err() {
            break;
        }
    }
}

#[async_trait]
impl ContainerBackend for CliBackend {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        debug!("Creating container {} from image {}", spec.name, spec.image);
        let id = self
            .run(Subject::Container, Self::create_args(spec))
            .await?;
        Ok(id.lines().last().unwrap_or_default().to_string())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(Subject::Container, ["start", id]).await.map(|_| ())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let output = self
            .run(Subject::Container, ["container", "inspect", id])
            .await?;
        let inspected: InspectedContainer = parse_inspect(Subject::Container, &output)?;
        Ok(inspected.into())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let output = self.run(Subject::Container, ["wait", id]).await?;
        output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                BackendError::Unavailable(format!("unexpected wait output: '{}'", output))
            })
    }

    async fn follow_logs(&self, id: &str, lines: UnboundedSender<String>) -> Result<()> {
        let mut command = self.command();
        command
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            BackendError::Unavailable(format!("failed to follow logs of {}: {}", id, e))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out = async {
            if let Some(stdout) = stdout {
                forward_lines(stdout, lines.clone()).await;
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                forward_lines(stderr, lines.clone()).await;
            }
        };
        tokio::join!(out, err);

        let status = child.wait().await.map_err(|e| {
            BackendError::Unavailable(format!("failed to follow logs of {}: {}", id, e))
        })?;
        if !status.success() {
            debug!("logs --follow for {} exited with {}", id, status);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.run(Subject::Container, ["kill", id]).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run(Subject::Container, ["rm", "--force", "--volumes", id])
            .await
            .map(|_| ())
    }

    async fn list_containers(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        args.extend(Self::filter_args(labels));
        let output = self.run(Subject::Container, args).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run(Subject::Network, args).await?;
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.run(Subject::Network, ["network", "rm", id])
            .await
            .map(|_| ())
    }

    async fn list_networks(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut args = vec![
            "network".to_string(),
            "ls".to_string(),
            "--quiet".to_string(),
        ];
        args.extend(Self::filter_args(labels));
        let output = self.run(Subject::Network, args).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        info!("Pulling image {}", name);
        self.run(Subject::Image, ["pull", name]).await.map(|_| ())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageInfo> {
        let output = self.run(Subject::Image, ["image", "inspect", name]).await?;
        let inspected: InspectedImage = parse_inspect(Subject::Image, &output)?;

        // docker keeps labels under Config, podman also at the top level
        let mut labels = inspected.config.labels.unwrap_or_default();
        labels.extend(inspected.labels.unwrap_or_default());

        Ok(ImageInfo {
            id: inspected.id,
            labels,
        })
    }
}
