//! Job agent
//!
//! Single entry point for running a job: `run(job, runner, cancel, sink)`.
//! Runs are independent and may proceed in parallel, up to the configured
//! limit. The helper image is resolved once per helper reference and shared
//! by all runs.

use keel_core::domain::job::{FailureKind, JobSpec, RunResult};
use keel_core::domain::runner::{ExecutorKind, RunnerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::ContainerBackend;
use crate::backend::labels::LABEL_TYPE;
use crate::backend::{ContainerKind, Labeler};
use crate::docker::{DockerExecutor, HelperImageResolver};
use crate::error::BackendError;
use crate::service::{BuildLifecycle, JobTrace, TraceSink};
use crate::signal::RunSignal;

/// Runs jobs on a container backend
pub struct Agent {
    backend: Arc<dyn ContainerBackend>,
    helpers: Mutex<HashMap<String, Arc<HelperImageResolver>>>,
    semaphore: Arc<Semaphore>,
    job_timeout: Duration,
}

impl Agent {
    /// Creates a new agent
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        max_parallel_jobs: usize,
        job_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            helpers: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_parallel_jobs.max(1))),
            job_timeout,
        }
    }

    fn helper_for(&self, runner: &RunnerConfig) -> Arc<HelperImageResolver> {
        let config = runner.docker.clone().unwrap_or_default();
        let mut helpers = self.helpers.lock().unwrap_or_else(|e| e.into_inner());
        helpers
            .entry(config.helper_image.clone())
            .or_insert_with(|| {
                Arc::new(HelperImageResolver::new(
                    Arc::clone(&self.backend),
                    config.helper_image.clone(),
                    config.pull_policy,
                ))
            })
            .clone()
    }

    /// Runs one job to completion, cancellation or timeout
    ///
    /// Waits for a free slot first; cancellation is honoured while waiting.
    /// The job timeout starts once the job actually starts.
    pub async fn run(
        &self,
        job: &JobSpec,
        runner: &RunnerConfig,
        cancel: CancellationToken,
        sink: Arc<dyn TraceSink>,
    ) -> RunResult {
        let trace = JobTrace::new(sink);

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace.log_error("Job canceled");
                return RunResult::cancelled();
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Job slots closed, not running job {}", job.id);
                    return RunResult::failed(FailureKind::Backend, "agent is shutting down");
                }
            },
        };

        info!("Starting execution of job {} on runner {}", job.id, runner.name);
        trace.log_info(format!(
            "Running with keel-runner {} on {}",
            env!("CARGO_PKG_VERSION"),
            runner.name
        ));

        if runner.executor != ExecutorKind::Docker {
            let message = format!("executor {} is not supported by this agent", runner.executor);
            trace.log_error(format!("Job failed: {}", message));
            return RunResult::failed(FailureKind::Configuration, message);
        }

        let timeout = job
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.job_timeout);
        let signal = RunSignal::new(cancel, timeout);

        let executor = DockerExecutor::new(
            Arc::clone(&self.backend),
            runner,
            runner.docker.clone().unwrap_or_default(),
            self.helper_for(runner),
            job,
            trace.clone(),
        );

        let result = BuildLifecycle::new(executor, job.clone(), trace, signal)
            .run()
            .await;

        info!("Job {} completed with status: {}", job.id, result.status);
        result
    }

    /// Removes resources of this runner left behind by earlier processes
    ///
    /// Only meant to run before any job starts: every job, network and
    /// service container of this runner is considered orphaned. Persistent
    /// cache containers are kept. Returns how many resources were removed.
    pub async fn reconcile_orphans(&self, runner: &RunnerConfig) -> Result<usize, BackendError> {
        let base = Labeler::runner_filter(&runner.short_token());
        let mut removed = 0;

        for kind in [ContainerKind::Build, ContainerKind::Predefined, ContainerKind::Service] {
            let mut filter = base.clone();
            filter.insert(LABEL_TYPE.to_string(), kind.as_str().to_string());

            for id in self.backend.list_containers(&filter).await? {
                match self.backend.remove_container(&id).await {
                    Ok(()) => {
                        debug!("Removed orphaned {} container {}", kind.as_str(), id);
                        removed += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
                }
            }
        }

        let mut filter = base;
        filter.insert(LABEL_TYPE.to_string(), "network".to_string());
        for id in self.backend.list_networks(&filter).await? {
            match self.backend.remove_network(&id).await {
                Ok(()) => {
                    debug!("Removed orphaned network {}", id);
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove orphaned network {}: {}", id, e),
            }
        }

        if removed > 0 {
            info!("Removed {} orphaned resource(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContainerSpec;
    use crate::backend::fake::FakeBackend;
    use crate::service::InMemoryTrace;
    use keel_core::domain::job::{JobStatus, Step, StepWhen};
    use keel_core::domain::runner::{ContainerConfig, RunnerCredentials};
    use keel_core::variables::JobVariables;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn runner() -> RunnerConfig {
        RunnerConfig {
            name: "runner-1".to_string(),
            credentials: RunnerCredentials {
                url: "https://ci.example.com".to_string(),
                token: "abcd1234".to_string(),
            },
            executor: ExecutorKind::Docker,
            docker: Some(ContainerConfig::default()),
        }
    }

    fn job() -> JobSpec {
        JobSpec {
            id: Uuid::new_v4(),
            project: "group/app".to_string(),
            image: None,
            services: Vec::new(),
            steps: vec![Step {
                name: "test".to_string(),
                script: vec!["make test".to_string()],
                when: StepWhen::OnSuccess,
                allow_failure: false,
            }],
            variables: JobVariables::default(),
            cache: Vec::new(),
            artifacts: Vec::new(),
            dependencies: Vec::new(),
            sources: None,
            timeout_seconds: None,
        }
    }

    fn labels(kind: &str, token: &str) -> BTreeMap<String, String> {
        let mut labels = Labeler::runner_filter(token);
        labels.insert(LABEL_TYPE.to_string(), kind.to_string());
        labels
    }

    #[tokio::test]
    async fn test_run_job() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 2, Duration::from_secs(60));
        let trace = InMemoryTrace::new();

        let result = agent
            .run(&job(), &runner(), CancellationToken::new(), Arc::new(trace.clone()))
            .await;

        assert!(result.is_success(), "{:?}", result);
        assert!(trace.text().starts_with("Running with keel-runner"));
        // default image and helper image
        assert_eq!(backend.count("pull"), 2);
    }

    #[tokio::test]
    async fn test_helper_is_shared_across_runs() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 2, Duration::from_secs(60));

        for _ in 0..2 {
            let result = agent
                .run(&job(), &runner(), CancellationToken::new(), Arc::new(InMemoryTrace::new()))
                .await;
            assert!(result.is_success());
        }

        let helper = ContainerConfig::default().helper_image;
        let helper_pulls = backend
            .calls()
            .iter()
            .filter(|c| **c == format!("pull:{}", helper))
            .count();
        assert_eq!(helper_pulls, 1);
    }

    #[tokio::test]
    async fn test_unsupported_executor() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 1, Duration::from_secs(60));
        let mut runner = runner();
        runner.executor = ExecutorKind::Shell;

        let result = agent
            .run(&job(), &runner, CancellationToken::new(), Arc::new(InMemoryTrace::new()))
            .await;

        assert_eq!(result.failure, Some(FailureKind::Configuration));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_canceled_while_waiting_for_a_slot() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 1, Duration::from_secs(60));
        let _busy = Arc::clone(&agent.semaphore).acquire_owned().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = agent
            .run(&job(), &runner(), token, Arc::new(InMemoryTrace::new()))
            .await;

        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_job_timeout_override() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 1, Duration::from_secs(3600));
        let mut job = job();
        job.timeout_seconds = Some(0);

        let result = agent
            .run(&job, &runner(), CancellationToken::new(), Arc::new(InMemoryTrace::new()))
            .await;

        assert_eq!(result.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_huge_job_timeout_runs_normally() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 1, Duration::from_secs(60));
        let mut job = job();
        job.timeout_seconds = Some(u64::MAX);

        let result = agent
            .run(&job, &runner(), CancellationToken::new(), Arc::new(InMemoryTrace::new()))
            .await;

        assert!(result.is_success(), "{:?}", result);
        assert!(backend.live_containers().iter().all(|c| {
            c.labels.get(LABEL_TYPE).map(String::as_str) == Some("cache")
        }));
    }

    #[tokio::test]
    async fn test_reconcile_orphans_keeps_cache_containers() {
        let backend = Arc::new(FakeBackend::new());
        let agent = Agent::new(backend.clone(), 1, Duration::from_secs(60));

        for kind in ["build", "predefined", "service", "cache"] {
            backend.insert_container(
                ContainerSpec {
                    name: format!("old-{}", kind),
                    labels: labels(kind, "abcd1234"),
                    ..Default::default()
                },
                None,
            );
        }
        backend.insert_container(
            ContainerSpec {
                name: "other-runner".to_string(),
                labels: labels("build", "zzzz9999"),
                ..Default::default()
            },
            None,
        );
        backend.insert_network("old-network", labels("network", "abcd1234"));

        let removed = agent.reconcile_orphans(&runner()).await.unwrap();

        assert_eq!(removed, 4);
        let left: Vec<String> = backend.live_containers().into_iter().map(|c| c.name).collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"old-cache".to_string()));
        assert!(left.contains(&"other-runner".to_string()));
        assert!(backend.networks().is_empty());
    }
}
