//! Container orchestration for one job
//!
//! Resolves and allow-lists the job's images, builds the job network, starts
//! service containers and runs step containers. Every container and network
//! created here is recorded in the run's [`TempResources`] as soon as the
//! backend hands out its id; [`ContainerOrchestrator::cleanup`] removes them.
//!
//! Lifecycle calls are not retried here. Backend failures go straight back to
//! the lifecycle controller, which fails the job.

use keel_core::domain::job::{ImageDescriptor, JobSpec};
use keel_core::domain::runner::ContainerConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::labels::{LABEL_SERVICE, LABEL_SERVICE_ALIAS, LABEL_TYPE};
use crate::backend::{ContainerBackend, ContainerKind, ContainerSpec, ImageInfo, Labeler};
use crate::docker::helper::{self, RetryPolicy};
use crate::docker::registry::{TempResource, TempResources};
use crate::error::{BackendError, BuildError, Result};
use crate::service::trace::JobTrace;
use crate::signal::RunSignal;

const SERVICE_READY_ATTEMPTS: u32 = 30;
const SERVICE_READY_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for a single kill or remove call issued outside the run's deadline
const TEARDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Images of a job after variable expansion and allow-listing
#[derive(Debug, Clone)]
pub struct ResolvedImages {
    pub primary: ImageDescriptor,
    pub services: Vec<ImageDescriptor>,
}

/// A started service container
#[derive(Debug, Clone)]
pub struct ServiceContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub aliases: Vec<String>,
}

/// Creates and tears down the containers of one job
pub struct ContainerOrchestrator {
    backend: Arc<dyn ContainerBackend>,
    config: ContainerConfig,
    labeler: Labeler,
    registry: Arc<TempResources>,
    trace: JobTrace,
    prefix: String,
    counter: AtomicUsize,
    ready_attempts: u32,
    ready_interval: Duration,
}

impl ContainerOrchestrator {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        config: ContainerConfig,
        labeler: Labeler,
        registry: Arc<TempResources>,
        trace: JobTrace,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            config,
            labeler,
            registry,
            trace,
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
            ready_attempts: SERVICE_READY_ATTEMPTS,
            ready_interval: SERVICE_READY_INTERVAL,
        }
    }

    /// Overrides how long services may take to report running
    pub fn with_readiness(mut self, attempts: u32, interval: Duration) -> Self {
        self.ready_attempts = attempts.max(1);
        self.ready_interval = interval;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Expands and validates every image the job refers to
    ///
    /// Variable references are expanded before the allow-lists are applied,
    /// so a variable cannot smuggle in an image the allow-list forbids.
    /// Nothing is created when this fails.
    pub fn resolve_images(&self, job: &JobSpec) -> Result<ResolvedImages> {
        let primary = match &job.image {
            Some(image) => {
                let image = image.expand(&job.variables);
                self.verify_allowed(&image.name, &self.config.allowed_images, "images")?;
                image
            }
            None => ImageDescriptor::new(self.config.image.clone()),
        };
        validate_reference(&primary.name)?;

        let mut services = Vec::with_capacity(job.services.len());
        for service in &job.services {
            let service = service.expand(&job.variables);
            self.verify_allowed(&service.name, &self.config.allowed_services, "services")?;
            validate_reference(&service.name)?;
            services.push(service);
        }

        Ok(ResolvedImages { primary, services })
    }

    fn verify_allowed(&self, name: &str, patterns: &[String], kind: &str) -> Result<()> {
        if patterns.is_empty() || patterns.iter().any(|p| glob_match::glob_match(p, name)) {
            return Ok(());
        }

        self.trace.log_error(format!(
            "The {} is not present on list of allowed {}",
            name, kind
        ));
        for pattern in patterns {
            self.trace.log_info(format!("- {}", pattern));
        }
        self.trace.log_info(format!(
            "Please check runner's allowed_{} configuration",
            kind
        ));

        Err(BuildError::Config(format!(
            "image {} is not allowed by allowed_{}",
            name, kind
        )))
    }

    /// Makes the image available according to the configured pull policy
    ///
    /// Job images are not retried; a missing tag fails the job right away.
    pub async fn ensure_image(&self, name: &str, signal: &RunSignal) -> Result<ImageInfo> {
        self.trace.log_info(format!("Using container image {} ...", name));
        let info = helper::ensure_image(
            self.backend.as_ref(),
            name,
            self.config.pull_policy,
            RetryPolicy::none(),
            signal,
        )
        .await?;
        debug!("Image {} resolved to {}", name, info.id);
        Ok(info)
    }

    /// Creates the private network linking the job and service containers
    pub async fn create_network(&self, signal: &RunSignal) -> Result<String> {
        let name = format!("{}-network", self.prefix);
        let mut labels = self.labeler.base();
        labels.insert(LABEL_TYPE.to_string(), "network".to_string());

        let id = match signal.guard(self.backend.create_network(&name, &labels)).await {
            Ok(result) => result?,
            Err(interrupt) => {
                self.registry.append_network(&name);
                return Err(interrupt.into());
            }
        };
        self.registry.append_network(&id);

        debug!("Created network {} ({})", name, id);
        Ok(id)
    }

    /// Creates and starts one container per service
    ///
    /// Containers are named by position, so services sharing an image never
    /// collide. Readiness is checked separately by [`Self::wait_for_services`].
    pub async fn start_services(
        &self,
        services: &[ImageDescriptor],
        network: &str,
        env: &[(String, String)],
        signal: &RunSignal,
    ) -> Result<Vec<ServiceContainer>> {
        let mut started = Vec::with_capacity(services.len());

        for (idx, service) in services.iter().enumerate() {
            self.trace.log_info(format!("Starting service {} ...", service.name));
            self.ensure_image(&service.name, signal).await?;

            let name = format!("{}-svc-{}-{}", self.prefix, idx, sanitize(&service.name));
            let aliases = service_aliases(service);
            let alias_label = aliases.join(",");

            let mut spec = ContainerSpec {
                name: name.clone(),
                image: service.name.clone(),
                entrypoint: service.entrypoint.clone(),
                cmd: service.command.clone(),
                env: env.to_vec(),
                network: Some(network.to_string()),
                network_aliases: aliases.clone(),
                privileged: self.config.privileged,
                ..Default::default()
            };
            self.labeler.label(
                &mut spec,
                ContainerKind::Service,
                &[
                    (LABEL_SERVICE, service.name.as_str()),
                    (LABEL_SERVICE_ALIAS, alias_label.as_str()),
                ],
            );

            let id = self.create(&spec, signal).await?;
            signal.guard(self.backend.start_container(&id)).await??;

            info!("Started service {} as {} ({})", service.name, name, id);
            started.push(ServiceContainer {
                id,
                name,
                image: service.name.clone(),
                aliases,
            });
        }

        Ok(started)
    }

    /// Waits until every service container reports running
    pub async fn wait_for_services(
        &self,
        services: &[ServiceContainer],
        signal: &RunSignal,
    ) -> Result<()> {
        for service in services {
            self.wait_for_service(service, signal).await?;
        }
        Ok(())
    }

    async fn wait_for_service(&self, service: &ServiceContainer, signal: &RunSignal) -> Result<()> {
        for attempt in 1..=self.ready_attempts {
            let info = signal
                .guard(self.backend.inspect_container(&service.id))
                .await??;

            if info.running {
                debug!("Service {} is running", service.name);
                return Ok(());
            }
            if let Some(code) = info.exit_code {
                self.trace.log_warning(format!(
                    "Service {} exited with code {} before becoming ready",
                    service.image, code
                ));
                return Err(BuildError::Backend(format!(
                    "service {} exited with code {}",
                    service.image, code
                )));
            }

            debug!(
                "Service {} is {} (attempt {}/{})",
                service.name, info.status, attempt, self.ready_attempts
            );
            signal.guard(tokio::time::sleep(self.ready_interval)).await?;
        }

        Err(BuildError::Backend(format!(
            "service {} did not start in time",
            service.image
        )))
    }

    /// Base spec of a step container with the configured passthrough settings
    pub fn step_spec(&self, stage: &str, image: &str) -> ContainerSpec {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        ContainerSpec {
            name: format!("{}-{}-{}", self.prefix, sanitize(stage), n),
            image: image.to_string(),
            binds: self.config.volumes.clone(),
            privileged: self.config.privileged,
            cpus: self.config.cpus.clone(),
            memory: self.config.memory.clone(),
            ..Default::default()
        }
    }

    /// Runs a container to completion, streaming its output to the trace
    ///
    /// Returns the exit code. On interruption the container is killed at the
    /// backend and left in the registry for cleanup. Otherwise it is removed
    /// right away.
    pub async fn run_container(
        &self,
        mut spec: ContainerSpec,
        kind: ContainerKind,
        signal: &RunSignal,
    ) -> Result<i64> {
        self.labeler.label(&mut spec, kind, &[]);
        let id = self.create(&spec, signal).await?;

        let result = self.attach_and_wait(&id, signal).await;

        match &result {
            Err(BuildError::Interrupted(interrupt)) => {
                info!("Killing container {} ({})", id, interrupt);
                let kill = self.backend.kill_container(&id);
                match tokio::time::timeout(TEARDOWN_CALL_TIMEOUT, kill).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to kill container {}: {}", id, e),
                    Err(_) => warn!("Timed out killing container {}", id),
                }
            }
            _ => self.remove_now(&id).await,
        }

        result
    }

    async fn attach_and_wait(&self, id: &str, signal: &RunSignal) -> Result<i64> {
        signal.guard(self.backend.start_container(id)).await??;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let trace = self.trace.clone();
        let forward = async move {
            while let Some(line) = rx.recv().await {
                trace.log_info(line);
            }
        };

        let streamed = async {
            let (logs, exit_code, ()) = tokio::join!(
                self.backend.follow_logs(id, tx),
                self.backend.wait_container(id),
                forward
            );
            if let Err(e) = logs {
                warn!("Failed to follow output of container {}: {}", id, e);
            }
            exit_code
        };

        Ok(signal.guard(streamed).await??)
    }

    async fn create(&self, spec: &ContainerSpec, signal: &RunSignal) -> Result<String> {
        let id = match signal.guard(self.backend.create_container(spec)).await {
            Ok(result) => result?,
            Err(interrupt) => {
                // The backend may have created it anyway; remove it by name
                self.registry.append_container(&spec.name);
                return Err(interrupt.into());
            }
        };
        self.registry.append_container(&id);
        Ok(id)
    }

    async fn remove_now(&self, id: &str) {
        match tokio::time::timeout(TEARDOWN_CALL_TIMEOUT, self.backend.remove_container(id)).await {
            Ok(Ok(())) => {
                self.registry.release(&TempResource::Container(id.to_string()));
            }
            Ok(Err(e)) => debug!("Container {} left for cleanup: {}", id, e),
            Err(_) => debug!("Container {} left for cleanup: remove timed out", id),
        }
    }

    /// Removes every resource recorded for this run
    ///
    /// Containers go first so the network is no longer in use when it is
    /// removed. Errors are logged and never stop the remaining removals.
    /// Calling this again finds an empty registry and does nothing.
    pub async fn cleanup(&self) {
        let resources = self.registry.drain();
        if resources.is_empty() {
            return;
        }
        debug!("Cleaning up {} resource(s)", resources.len());

        let (containers, networks): (Vec<_>, Vec<_>) = resources
            .into_iter()
            .partition(|r| matches!(r, TempResource::Container(_)));

        for resource in containers.iter().chain(networks.iter()) {
            let removal = match resource {
                TempResource::Container(id) => self.backend.remove_container(id),
                TempResource::Network(id) => self.backend.remove_network(id),
            };

            match tokio::time::timeout(TEARDOWN_CALL_TIMEOUT, removal).await {
                Ok(Ok(())) => debug!("Removed {:?}", resource),
                Ok(Err(BackendError::NoSuchObject(_))) => debug!("{:?} already gone", resource),
                Ok(Err(e)) => warn!("Failed to remove {:?}: {}", resource, e),
                Err(_) => warn!("Timed out removing {:?}", resource),
            }
        }
    }
}

/// Rejects references the backend could never resolve
fn validate_reference(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BuildError::Config(
            "image name is empty after variable expansion".to_string(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(BuildError::Config(format!(
            "invalid reference format: {:?}",
            name
        )));
    }
    Ok(())
}

/// Hostnames a service is reachable under
///
/// The explicit alias first, then two names derived from the image
/// repository without tag or digest: `/` replaced by `__` and by `-`.
pub fn service_aliases(service: &ImageDescriptor) -> Vec<String> {
    let mut aliases = Vec::new();
    if let Some(alias) = service.alias.as_deref().filter(|a| !a.is_empty()) {
        aliases.push(alias.to_string());
    }

    let repository = repository_of(&service.name);
    for derived in [repository.replace('/', "__"), repository.replace('/', "-")] {
        if !derived.is_empty() && !aliases.contains(&derived) {
            aliases.push(derived);
        }
    }
    aliases
}

fn repository_of(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    let last_segment = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment..].find(':') {
        Some(colon) => &image[..last_segment + colon],
        None => image,
    }
}

/// Container-name-safe form of an arbitrary string
pub(crate) fn sanitize(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}
