//! Build stages and the executor contract
//!
//! Every execution backend (container, shell, ssh, virtual machine) offers
//! the same three operations: prepare the environment, run one stage script,
//! clean everything up. The lifecycle controller only talks to this trait.

use async_trait::async_trait;
use keel_core::domain::job::JobSpec;

use crate::error::Result;
use crate::signal::RunSignal;

/// Stages of a build, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Prepare,
    GetSources,
    RestoreCache,
    DownloadArtifacts,
    Step,
    ArchiveCache,
    UploadArtifacts,
    Cleanup,
}

impl BuildStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::Prepare => "prepare",
            BuildStage::GetSources => "get-sources",
            BuildStage::RestoreCache => "restore-cache",
            BuildStage::DownloadArtifacts => "download-artifacts",
            BuildStage::Step => "step",
            BuildStage::ArchiveCache => "archive-cache",
            BuildStage::UploadArtifacts => "upload-artifacts",
            BuildStage::Cleanup => "cleanup",
        }
    }

    /// Stages whose scripts run in the helper image rather than the job image
    pub fn is_predefined(self) -> bool {
        matches!(
            self,
            BuildStage::GetSources
                | BuildStage::RestoreCache
                | BuildStage::DownloadArtifacts
                | BuildStage::ArchiveCache
                | BuildStage::UploadArtifacts
        )
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One script to run for a stage
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    pub stage: BuildStage,
    pub script: String,
}

impl ExecutorCommand {
    pub fn new(stage: BuildStage, script: impl Into<String>) -> Self {
        Self {
            stage,
            script: script.into(),
        }
    }
}

/// Execution backend for one run
#[async_trait]
pub trait Executor: Send {
    /// Stands up the execution environment
    async fn prepare(&mut self, job: &JobSpec, signal: &RunSignal) -> Result<()>;

    /// Runs one stage script; a non-zero exit is [`crate::error::BuildError::ScriptFailure`]
    async fn run(&mut self, command: ExecutorCommand, signal: &RunSignal) -> Result<()>;

    /// Destroys everything the run created
    ///
    /// Never fails and is not bound by the run's deadline. Calling it more
    /// than once is harmless.
    async fn cleanup(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_stages() {
        assert!(BuildStage::GetSources.is_predefined());
        assert!(BuildStage::UploadArtifacts.is_predefined());
        assert!(!BuildStage::Step.is_predefined());
        assert!(!BuildStage::Prepare.is_predefined());
        assert!(!BuildStage::Cleanup.is_predefined());
    }
}
