//! Build lifecycle controller
//!
//! Drives one job through its stages in order:
//! prepare, get sources, restore cache, download artifacts, steps, archive
//! cache, upload artifacts and finally cleanup, which always runs exactly
//! once whatever happened before.
//!
//! Cancellation and timeout are terminal states of their own, not failures.
//! An error in any stage skips the remaining work and goes straight to
//! cleanup.

use keel_core::domain::job::{ArtifactSpec, CacheSpec, JobSpec, RunResult};
use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};
use crate::service::script;
use crate::service::stage::{BuildStage, Executor, ExecutorCommand};
use crate::service::trace::JobTrace;
use crate::signal::{Interrupt, RunSignal};

/// Mutable state of a run, owned by the controller
#[derive(Debug)]
pub struct RunState {
    pub stage: BuildStage,

    /// First step failure that was not allowed to fail
    pub failure: Option<BuildError>,
}

impl RunState {
    fn new() -> Self {
        Self {
            stage: BuildStage::Prepare,
            failure: None,
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Runs one job on an executor
pub struct BuildLifecycle<E: Executor> {
    executor: E,
    job: JobSpec,
    trace: JobTrace,
    signal: RunSignal,
    state: RunState,
}

impl<E: Executor> BuildLifecycle<E> {
    pub fn new(executor: E, job: JobSpec, trace: JobTrace, signal: RunSignal) -> Self {
        Self {
            executor,
            job,
            trace,
            signal,
            state: RunState::new(),
        }
    }

    /// Runs the job to its terminal state
    pub async fn run(mut self) -> RunResult {
        info!("Starting job {}", self.job.id);

        let outcome = self.execute().await;

        self.state.stage = BuildStage::Cleanup;
        debug!("Cleaning up job {}", self.job.id);
        self.executor.cleanup().await;

        self.finish(outcome)
    }

    async fn execute(&mut self) -> Result<()> {
        self.enter(BuildStage::Prepare)?;
        self.executor.prepare(&self.job, &self.signal).await?;

        self.enter(BuildStage::GetSources)?;
        let sources = script::get_sources(
            &self.job.variables,
            &self.job.project,
            self.job.sources.as_ref(),
        );
        self.run_stage(BuildStage::GetSources, sources).await?;

        self.enter(BuildStage::RestoreCache)?;
        self.restore_caches().await?;

        self.enter(BuildStage::DownloadArtifacts)?;
        if !self.job.dependencies.is_empty() {
            let download = script::download_artifacts(
                &self.job.variables,
                &self.job.project,
                &self.job.dependencies,
            );
            self.run_stage(BuildStage::DownloadArtifacts, download).await?;
        }

        self.enter(BuildStage::Step)?;
        self.run_steps().await?;

        let failed = self.state.has_failed();
        self.enter(BuildStage::ArchiveCache)?;
        if failed {
            self.skip_archive_after_failure();
        } else {
            self.archive_caches().await?;
        }

        self.enter(BuildStage::UploadArtifacts)?;
        if let Err(e) = self.upload_artifacts(failed).await {
            match (self.state.failure.take(), e) {
                (_, interrupted @ BuildError::Interrupted(_)) => return Err(interrupted),
                (Some(failure), e) => {
                    warn!("Uploading artifacts of failed job {} failed: {}", self.job.id, e);
                    self.trace.log_warning(format!("Uploading artifacts failed: {}", e));
                    return Err(failure);
                }
                (None, e) => return Err(e),
            }
        }

        match self.state.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn enter(&mut self, stage: BuildStage) -> Result<()> {
        self.state.stage = stage;
        debug!("Job {} entering stage {}", self.job.id, stage);
        self.signal.check()?;
        Ok(())
    }

    async fn run_stage(&mut self, stage: BuildStage, script: String) -> Result<()> {
        self.executor
            .run(ExecutorCommand::new(stage, script), &self.signal)
            .await
    }

    fn cache_key(&self, cache: &CacheSpec) -> String {
        let key = self.job.variables.expand(&cache.key).replace('/', "-");
        if key.trim().is_empty() {
            "default".to_string()
        } else {
            key
        }
    }

    async fn restore_caches(&mut self) -> Result<()> {
        let caches = self.job.cache.clone();
        for cache in &caches {
            let key = self.cache_key(cache);
            if !cache.policy.pulls() {
                self.trace
                    .log_info(format!("Not downloading cache {} due to policy", key));
                continue;
            }

            let restore = script::restore_cache(&self.job.variables, &self.job.project, &key);
            match self.run_stage(BuildStage::RestoreCache, restore).await {
                Err(BuildError::ScriptFailure(code)) => {
                    self.trace.log_warning(format!(
                        "Failed to extract cache {} (exit code {})",
                        key, code
                    ));
                }
                other => other?,
            }
        }
        Ok(())
    }

    async fn archive_caches(&mut self) -> Result<()> {
        let caches = self.job.cache.clone();
        for cache in &caches {
            let key = self.cache_key(cache);
            if !cache.policy.pushes() {
                self.trace
                    .log_info(format!("Not uploading cache {} due to policy", key));
                continue;
            }
            if cache.paths.is_empty() {
                self.trace
                    .log_info(format!("Skipping cache {}: no paths to archive", key));
                continue;
            }

            let archive = script::archive_cache(
                &self.job.variables,
                &self.job.project,
                &key,
                &cache.paths,
            );
            match self.run_stage(BuildStage::ArchiveCache, archive).await {
                Err(BuildError::ScriptFailure(code)) => {
                    self.trace.log_warning(format!(
                        "Failed to create cache {} (exit code {})",
                        key, code
                    ));
                }
                other => other?,
            }
        }
        Ok(())
    }

    fn skip_archive_after_failure(&self) {
        for cache in self.job.cache.iter().filter(|c| c.policy.pushes()) {
            let key = self.cache_key(cache);
            self.trace
                .log_info(format!("Not uploading cache {} due to job failure", key));
        }
    }

    async fn run_steps(&mut self) -> Result<()> {
        let steps = self.job.steps.clone();

        for step in &steps {
            self.signal.check()?;

            if !step.when.should_run(self.state.has_failed()) {
                debug!("Skipping step {} ({:?})", step.name, step.when);
                continue;
            }

            self.trace
                .log_info(format!("Executing step \"{}\"", step.name));
            let body = script::step(&self.job.variables, &self.job.project, step);

            match self.run_stage(BuildStage::Step, body).await {
                Ok(()) => {}
                Err(BuildError::ScriptFailure(code)) if step.allow_failure => {
                    self.trace.log_warning(format!(
                        "Step \"{}\" failed with exit code {}, but is allowed to fail",
                        step.name, code
                    ));
                }
                Err(BuildError::ScriptFailure(code)) => {
                    self.trace.log_error(format!(
                        "Step \"{}\" failed with exit code {}",
                        step.name, code
                    ));
                    if self.state.failure.is_none() {
                        self.state.failure = Some(BuildError::ScriptFailure(code));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn upload_artifacts(&mut self, failed: bool) -> Result<()> {
        let artifacts: Vec<ArtifactSpec> = self
            .job
            .artifacts
            .iter()
            .filter(|a| a.when.should_upload(failed))
            .cloned()
            .collect();
        if artifacts.is_empty() {
            return Ok(());
        }

        let refs: Vec<&ArtifactSpec> = artifacts.iter().collect();
        let upload = script::upload_artifacts(&self.job.variables, &self.job.project, &refs);
        self.run_stage(BuildStage::UploadArtifacts, upload).await
    }

    fn finish(&self, outcome: Result<()>) -> RunResult {
        let result = match outcome {
            Ok(()) => {
                self.trace.log_info("Job succeeded");
                RunResult::success()
            }
            Err(BuildError::Interrupted(Interrupt::Canceled)) => {
                self.trace.log_error("Job canceled");
                RunResult::cancelled()
            }
            Err(BuildError::Interrupted(Interrupt::TimedOut)) => {
                self.trace.log_error("Job timed out");
                RunResult::timed_out()
            }
            Err(e) => {
                self.trace.log_error(format!("Job failed: {}", e));
                e.into_run_result()
            }
        };

        info!(
            "Job {} finished in stage {}: {}",
            self.job.id, self.state.stage, result.status
        );
        result
    }
}
