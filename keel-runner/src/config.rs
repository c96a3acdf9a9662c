//! Agent configuration
//!
//! Defines the runner identity, container executor settings and the limits
//! applied to every job. Loaded from environment variables.

use keel_core::domain::runner::{
    BackendKind, ContainerConfig, ExecutorKind, PullPolicy, RunnerConfig, RunnerCredentials,
};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Runner identity and executor settings handed to every run
    pub runner: RunnerConfig,

    /// Maximum time a job can run before timing out, unless the job overrides it
    pub job_timeout: Duration,

    /// Max parallel jobs the agent runs
    pub max_parallel_jobs: usize,

    /// JSON job description to run
    pub job_file: Option<PathBuf>,
}

impl AgentConfig {
    /// Creates a new configuration with defaults
    pub fn new(name: String, url: String, token: String) -> Self {
        Self {
            runner: RunnerConfig {
                name,
                credentials: RunnerCredentials { url, token },
                executor: ExecutorKind::Docker,
                docker: Some(ContainerConfig::default()),
            },
            job_timeout: Duration::from_secs(3600),
            max_parallel_jobs: 2,
            job_file: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - RUNNER_URL (required)
    /// - RUNNER_TOKEN (required)
    /// - RUNNER_NAME (optional, default: keel-runner)
    /// - EXECUTOR (optional, default: docker)
    /// - CONTAINER_RUNTIME (optional, podman|docker, default: podman)
    /// - CONTAINER_HOST (optional)
    /// - DEFAULT_IMAGE, HELPER_IMAGE (optional)
    /// - ALLOWED_IMAGES, ALLOWED_SERVICES (optional, comma separated globs)
    /// - PRIVILEGED (optional, default: false)
    /// - VOLUMES (optional, comma separated host bindings)
    /// - CPUS, MEMORY (optional)
    /// - PULL_POLICY (optional, always|if-not-present|never)
    /// - JOB_TIMEOUT (optional, seconds, default: 3600)
    /// - MAX_PARALLEL_JOBS (optional, default: 2)
    /// - JOB_FILE (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("RUNNER_URL")
            .map_err(|_| anyhow::anyhow!("RUNNER_URL environment variable not set"))?;

        let token = std::env::var("RUNNER_TOKEN")
            .map_err(|_| anyhow::anyhow!("RUNNER_TOKEN environment variable not set"))?;

        let name = std::env::var("RUNNER_NAME").unwrap_or_else(|_| "keel-runner".to_string());

        let mut config = Self::new(name, url, token);

        if let Some(executor) = env_opt("EXECUTOR") {
            config.runner.executor = executor
                .parse::<ExecutorKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }

        let mut docker = ContainerConfig::default();

        if let Some(runtime) = env_opt("CONTAINER_RUNTIME") {
            docker.backend = parse_backend(&runtime)?;
        }
        docker.host = env_opt("CONTAINER_HOST");
        if let Some(image) = env_opt("DEFAULT_IMAGE") {
            docker.image = image;
        }
        if let Some(image) = env_opt("HELPER_IMAGE") {
            docker.helper_image = image;
        }
        docker.allowed_images = env_list("ALLOWED_IMAGES");
        docker.allowed_services = env_list("ALLOWED_SERVICES");
        docker.privileged = env_opt("PRIVILEGED")
            .map(|s| parse_bool(&s))
            .unwrap_or(false);
        docker.volumes = env_list("VOLUMES");
        docker.cpus = env_opt("CPUS");
        docker.memory = env_opt("MEMORY");
        if let Some(policy) = env_opt("PULL_POLICY") {
            docker.pull_policy = policy
                .parse::<PullPolicy>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        config.runner.docker = Some(docker);

        config.job_timeout = env_opt("JOB_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        config.max_parallel_jobs = env_opt("MAX_PARALLEL_JOBS")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2);

        config.job_file = env_opt("JOB_FILE").map(PathBuf::from);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner.name.is_empty() {
            anyhow::bail!("runner name cannot be empty");
        }

        let url = &self.runner.credentials.url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("runner url must start with http:// or https://");
        }

        if self.job_timeout.as_secs() == 0 {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        if let Some(docker) = &self.runner.docker {
            if docker.image.trim().is_empty() {
                anyhow::bail!("default image cannot be empty");
            }
            if docker.helper_image.trim().is_empty() {
                anyhow::bail!("helper image cannot be empty");
            }
        } else if self.runner.executor == ExecutorKind::Docker {
            anyhow::bail!("docker executor selected without container settings");
        }

        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(
            "keel-runner".to_string(),
            "http://localhost:8080".to_string(),
            String::new(),
        )
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key).map(|s| split_list(&s)).unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_backend(value: &str) -> anyhow::Result<BackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "podman" => Ok(BackendKind::Podman),
        "docker" => Ok(BackendKind::Docker),
        other => anyhow::bail!("unknown container runtime '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_parallel_jobs, 2);
        assert_eq!(config.runner.executor, ExecutorKind::Docker);
        assert!(config.job_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Empty name should fail
        config.runner.name = String::new();
        assert!(config.validate().is_err());

        config.runner.name = "test".to_string();

        // Invalid URL should fail
        config.runner.credentials.url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config.runner.credentials.url = "https://ci.example.com".to_string();
        assert!(config.validate().is_ok());

        config.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
        config.max_parallel_jobs = 1;

        if let Some(docker) = config.runner.docker.as_mut() {
            docker.helper_image = " ".to_string();
        }
        assert!(config.validate().is_err());

        config.runner.docker = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("ruby:*, postgres:*,,registry.example.com/**"),
            vec!["ruby:*", "postgres:*", "registry.example.com/**"]
        );
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_parse_helpers() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("no"));
        assert_eq!(parse_backend("Docker").unwrap(), BackendKind::Docker);
        assert!(parse_backend("lxc").is_err());
    }
}
