//! Runner domain model
//!
//! Settings of the runner executing a job. Owned by the caller and read-only
//! for the duration of a run.

use serde::{Deserialize, Serialize};

/// Runner identity and execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Human readable runner name
    pub name: String,

    pub credentials: RunnerCredentials,

    /// Execution backend selected for this runner
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Settings for the container executor
    #[serde(default)]
    pub docker: Option<ContainerConfig>,
}

impl RunnerConfig {
    /// Short, name-safe prefix of the runner token
    ///
    /// Used to namespace containers belonging to this runner on a shared host.
    pub fn short_token(&self) -> String {
        let token: String = self
            .credentials
            .token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();

        if token.is_empty() {
            "local".to_string()
        } else {
            token.to_ascii_lowercase()
        }
    }
}

/// Control plane credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerCredentials {
    pub url: String,
    pub token: String,
}

/// Execution backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Docker,
    Shell,
    Ssh,
    Virtualbox,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Docker => write!(f, "docker"),
            ExecutorKind::Shell => write!(f, "shell"),
            ExecutorKind::Ssh => write!(f, "ssh"),
            ExecutorKind::Virtualbox => write!(f, "virtualbox"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ExecutorKind::Docker),
            "shell" => Ok(ExecutorKind::Shell),
            "ssh" => Ok(ExecutorKind::Ssh),
            "virtualbox" => Ok(ExecutorKind::Virtualbox),
            other => Err(format!("unknown executor '{}'", other)),
        }
    }
}

/// Container runtime CLI flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Podman,
    Docker,
}

impl BackendKind {
    pub fn program(self) -> &'static str {
        match self {
            BackendKind::Podman => "podman",
            BackendKind::Docker => "docker",
        }
    }
}

/// When images are pulled before use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(format!("unknown pull policy '{}'", other)),
        }
    }
}

/// Settings of the container executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Backend endpoint (e.g. "unix:///run/podman/podman.sock"); local default when absent
    #[serde(default)]
    pub host: Option<String>,

    /// Image used when the job does not name one
    pub image: String,

    /// Utility image used for sources, cache and artifact stages
    pub helper_image: String,

    /// Glob patterns the job image must match; empty means unrestricted
    #[serde(default)]
    pub allowed_images: Vec<String>,

    /// Glob patterns every service image must match; empty means unrestricted
    #[serde(default)]
    pub allowed_services: Vec<String>,

    #[serde(default)]
    pub privileged: bool,

    /// Host bindings passed verbatim to the backend ("src:dst[:mode]")
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub cpus: Option<String>,

    #[serde(default)]
    pub memory: Option<String>,

    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            host: None,
            image: "alpine:latest".to_string(),
            helper_image: "registry.keel.dev/keel-helper:latest".to_string(),
            allowed_images: Vec::new(),
            allowed_services: Vec::new(),
            privileged: false,
            volumes: Vec::new(),
            cpus: None,
            memory: None,
            pull_policy: PullPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_token(token: &str) -> RunnerConfig {
        RunnerConfig {
            name: "test".to_string(),
            credentials: RunnerCredentials {
                url: "https://ci.example.com".to_string(),
                token: token.to_string(),
            },
            executor: ExecutorKind::Docker,
            docker: None,
        }
    }

    #[test]
    fn test_short_token() {
        assert_eq!(config_with_token("AbCd-1234efgh5678").short_token(), "abcd1234");
        assert_eq!(config_with_token("").short_token(), "local");
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("Docker".parse::<ExecutorKind>(), Ok(ExecutorKind::Docker));
        assert!("kubernetes".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("never".parse::<PullPolicy>(), Ok(PullPolicy::Never));
        assert_eq!(
            "if-not-present".parse::<PullPolicy>(),
            Ok(PullPolicy::IfNotPresent)
        );
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }
}
