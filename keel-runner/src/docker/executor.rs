//! Container executor
//!
//! Runs each stage of a job in a fresh container. Sources, cache and
//! artifact stages use the helper image; user steps use the job image. All
//! of them share the job network and mount the persistent `/builds` and
//! `/cache` volumes of the project's cache containers.

use async_trait::async_trait;
use keel_core::domain::job::JobSpec;
use keel_core::domain::runner::{ContainerConfig, RunnerConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{ContainerBackend, ContainerKind, Labeler};
use crate::docker::cache::CacheContainerManager;
use crate::docker::helper::HelperImageResolver;
use crate::docker::orchestrator::{ContainerOrchestrator, ServiceContainer, sanitize};
use crate::docker::registry::TempResources;
use crate::error::{BackendError, BuildError, Result};
use crate::service::script::{self, BUILDS_DIR, CACHE_DIR};
use crate::service::stage::{Executor, ExecutorCommand};
use crate::service::trace::JobTrace;
use crate::signal::RunSignal;

/// Environment of the execution environment once it is up
#[derive(Debug, Clone)]
struct Prepared {
    image: String,
    entrypoint: Vec<String>,
    helper_image: String,
    network: String,
    volumes_from: Vec<String>,
    services: Vec<ServiceContainer>,
}

/// Container implementation of [`Executor`]
pub struct DockerExecutor {
    orchestrator: ContainerOrchestrator,
    caches: CacheContainerManager,
    helper: Arc<HelperImageResolver>,
    trace: JobTrace,
    runner_token: String,
    project: String,
    env: Vec<(String, String)>,
    prepared: Option<Prepared>,
}

impl DockerExecutor {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        runner: &RunnerConfig,
        config: ContainerConfig,
        helper: Arc<HelperImageResolver>,
        job: &JobSpec,
        trace: JobTrace,
    ) -> Self {
        let token = runner.short_token();
        let labeler = Labeler::new(token.clone(), runner.name.clone(), job.id);
        let registry = Arc::new(TempResources::new());
        let prefix = format!("keel-{}-job-{}", token, job.id.simple());

        let orchestrator = ContainerOrchestrator::new(
            backend.clone(),
            config,
            labeler.clone(),
            registry.clone(),
            trace.clone(),
            prefix,
        );
        let caches = CacheContainerManager::new(backend, helper.clone(), labeler, registry);

        Self {
            orchestrator,
            caches,
            helper,
            trace,
            runner_token: token,
            project: job.project.clone(),
            env: job_env(job, runner),
            prepared: None,
        }
    }

    #[cfg(test)]
    fn with_orchestrator(
        mut self,
        f: impl FnOnce(ContainerOrchestrator) -> ContainerOrchestrator,
    ) -> Self {
        self.orchestrator = f(self.orchestrator);
        self
    }

    /// Deterministic cache container name for a project path
    ///
    /// Same runner, same project and same path always give the same name,
    /// which is what makes the cache persistent across runs.
    fn cache_container_name(&self, path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        let digest = hasher.finalize();
        let project = match sanitize(&self.project) {
            p if p.is_empty() => "project".to_string(),
            p => p,
        };
        format!(
            "keel-{}-project-{}-cache-{}",
            self.runner_token,
            project,
            hex::encode(&digest[..8])
        )
    }

    async fn cache_volumes(
        &self,
        signal: &RunSignal,
    ) -> std::result::Result<Vec<String>, BackendError> {
        let mut ids = Vec::new();
        for path in [BUILDS_DIR, CACHE_DIR] {
            let name = self.cache_container_name(path);
            ids.push(self.caches.ensure(&name, path, signal).await?);
        }
        Ok(ids)
    }
}

/// Step environment: job variables plus the predefined ones
///
/// File variables hold the path their content is written to.
fn job_env(job: &JobSpec, runner: &RunnerConfig) -> Vec<(String, String)> {
    let mut env = vec![
        ("CI".to_string(), "true".to_string()),
        ("KEEL_JOB_ID".to_string(), job.id.to_string()),
        ("KEEL_PROJECT_DIR".to_string(), script::project_dir(&job.project)),
        ("KEEL_SERVER_URL".to_string(), runner.credentials.url.clone()),
        ("KEEL_RUNNER_NAME".to_string(), runner.name.clone()),
    ];
    for variable in job.variables.iter() {
        let value = if variable.file {
            script::file_variable_path(&variable.key)
        } else {
            variable.value.clone()
        };
        env.push((variable.key.clone(), value));
    }
    env
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn prepare(&mut self, job: &JobSpec, signal: &RunSignal) -> Result<()> {
        let images = self.orchestrator.resolve_images(job)?;
        self.trace.log_info(format!(
            "Using container executor with image {} ...",
            images.primary.name
        ));

        let network = self.orchestrator.create_network(signal).await?;

        // Services come up while the job image, helper and caches are prepared
        let (services, primary, helper, volumes_from) = tokio::join!(
            self.orchestrator
                .start_services(&images.services, &network, &self.env, signal),
            self.orchestrator.ensure_image(&images.primary.name, signal),
            self.helper.resolve(signal),
            self.cache_volumes(signal),
        );
        let services = services?;
        primary?;
        let helper = helper?;
        let volumes_from = volumes_from?;

        if !services.is_empty() {
            self.trace.log_info("Waiting for services to be up and running...");
            self.orchestrator.wait_for_services(&services, signal).await?;
        }

        info!(
            "Prepared job environment {} ({} service(s))",
            self.orchestrator.prefix(),
            services.len()
        );
        self.prepared = Some(Prepared {
            image: images.primary.name,
            entrypoint: images.primary.entrypoint,
            helper_image: helper.id,
            network,
            volumes_from,
            services,
        });
        Ok(())
    }

    async fn run(&mut self, command: ExecutorCommand, signal: &RunSignal) -> Result<()> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| BuildError::Config("executor used before prepare".to_string()))?;

        let (image, kind) = if command.stage.is_predefined() {
            (prepared.helper_image.as_str(), ContainerKind::Predefined)
        } else {
            (prepared.image.as_str(), ContainerKind::Build)
        };

        let mut spec = self.orchestrator.step_spec(command.stage.as_str(), image);
        if kind == ContainerKind::Build {
            spec.entrypoint = prepared.entrypoint.clone();
        }
        spec.cmd = vec!["sh".to_string(), "-c".to_string(), command.script];
        spec.env = self.env.clone();
        spec.volumes_from = prepared.volumes_from.clone();
        spec.network = Some(prepared.network.clone());
        spec.working_dir = Some(script::project_dir(&self.project));

        debug!(
            "Running {} stage in {} ({} service(s) attached)",
            command.stage,
            image,
            prepared.services.len()
        );
        match self.orchestrator.run_container(spec, kind, signal).await? {
            0 => Ok(()),
            code => Err(BuildError::ScriptFailure(code)),
        }
    }

    async fn cleanup(&mut self) {
        self.orchestrator.cleanup().await;
        self.prepared = None;
    }
}
