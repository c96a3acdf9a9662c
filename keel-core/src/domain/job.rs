//! Job domain types
//!
//! A [`JobSpec`] is the job response handed to the agent by the control plane.
//! It is read-only for the whole run.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::variables::JobVariables;

/// Job description received from the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Uuid,

    /// Project path, used to key persistent cache containers
    #[serde(default)]
    pub project: String,

    /// Primary image; the runner's default image is used when absent
    #[serde(default)]
    pub image: Option<ImageDescriptor>,

    #[serde(default)]
    pub services: Vec<ImageDescriptor>,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub variables: JobVariables,

    #[serde(default)]
    pub cache: Vec<CacheSpec>,

    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,

    /// Names of earlier jobs whose artifacts are downloaded before the steps run
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub sources: Option<SourceSpec>,

    /// Overrides the runner's job timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Image reference for the primary container or a service
///
/// Identity is the (resolved) name plus alias; entrypoint and command
/// overrides do not take part in equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub name: String,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub alias: Option<String>,
}

impl ImageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Returns a copy with variable references in the name and alias expanded
    pub fn expand(&self, variables: &JobVariables) -> Self {
        Self {
            name: variables.expand(&self.name),
            entrypoint: self.entrypoint.clone(),
            command: self.command.clone(),
            alias: self.alias.as_deref().map(|a| variables.expand(a)),
        }
    }
}

impl PartialEq for ImageDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.alias == other.alias
    }
}

impl Eq for ImageDescriptor {}

impl Hash for ImageDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.alias.hash(state);
    }
}

/// A named group of script lines executed in the primary image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub script: Vec<String>,

    #[serde(default)]
    pub when: StepWhen,

    #[serde(default)]
    pub allow_failure: bool,
}

/// Execution condition of a step, evaluated against the accumulated status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepWhen {
    Always,
    #[default]
    OnSuccess,
    OnFailure,
}

impl StepWhen {
    /// Whether a step with this condition runs given that an earlier step failed or not
    pub fn should_run(self, failed: bool) -> bool {
        match self {
            StepWhen::Always => true,
            StepWhen::OnSuccess => !failed,
            StepWhen::OnFailure => failed,
        }
    }
}

/// Cache declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub policy: CachePolicy,
}

/// Whether a cache is restored before and/or archived after the steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    #[default]
    None,
    Pull,
    Push,
    PullPush,
}

impl CachePolicy {
    pub fn pulls(self) -> bool {
        matches!(self, CachePolicy::Pull | CachePolicy::PullPush)
    }

    pub fn pushes(self) -> bool {
        matches!(self, CachePolicy::Push | CachePolicy::PullPush)
    }
}

/// Artifact declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub when: ArtifactWhen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl ArtifactWhen {
    pub fn should_upload(self, failed: bool) -> bool {
        match self {
            ArtifactWhen::Always => true,
            ArtifactWhen::OnSuccess => !failed,
            ArtifactWhen::OnFailure => failed,
        }
    }
}

/// Where the job's sources come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub repo_url: String,
    pub sha: String,

    #[serde(default)]
    pub ref_name: Option<String>,

    /// Shallow clone depth, 0 = full history
    #[serde(default)]
    pub depth: u32,
}

/// A job variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVariable {
    pub key: String,
    pub value: String,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub internal: bool,

    /// Value is written to a file and the variable holds its path
    #[serde(default)]
    pub file: bool,
}

impl JobVariable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            public: true,
            internal: false,
            file: false,
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "canceled"),
            JobStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Why a failed run failed
///
/// Lets callers decide whether retrying the whole job is worthwhile:
/// backend failures may be transient, the others are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Configuration,
    Content,
    Backend,
    Script,
}

/// Result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

impl RunResult {
    pub fn success() -> Self {
        Self {
            status: JobStatus::Succeeded,
            failure: None,
            message: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            failure: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            failure: None,
            message: Some("canceled".to_string()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: JobStatus::TimedOut,
            failure: None,
            message: Some("execution took longer than the job timeout".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}
