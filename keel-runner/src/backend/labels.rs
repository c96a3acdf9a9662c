//! Labels applied to everything the agent creates
//!
//! Labels identify ownership (runner, job) and resource type. They back the
//! host-wide reconciliation of resources left behind by crashed runs, which
//! works independently of the in-run temporary resource registry.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::ContainerSpec;

pub const LABEL_MANAGED: &str = "dev.keel.managed";
pub const LABEL_RUNNER: &str = "dev.keel.runner.token";
pub const LABEL_RUNNER_NAME: &str = "dev.keel.runner.name";
pub const LABEL_JOB_ID: &str = "dev.keel.job.id";
pub const LABEL_TYPE: &str = "dev.keel.type";
pub const LABEL_CACHE_DIR: &str = "dev.keel.cache.dir";
pub const LABEL_SERVICE: &str = "dev.keel.service";
pub const LABEL_SERVICE_ALIAS: &str = "dev.keel.service.alias";

/// What a container is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Runs a user step in the job image
    Build,
    /// Runs a sources/cache/artifacts stage in the helper image
    Predefined,
    Service,
    Cache,
}

impl ContainerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Build => "build",
            ContainerKind::Predefined => "predefined",
            ContainerKind::Service => "service",
            ContainerKind::Cache => "cache",
        }
    }
}

/// Applies job-scoped labels
#[derive(Debug, Clone)]
pub struct Labeler {
    runner_token: String,
    runner_name: String,
    job_id: Uuid,
}

impl Labeler {
    pub fn new(
        runner_token: impl Into<String>,
        runner_name: impl Into<String>,
        job_id: Uuid,
    ) -> Self {
        Self {
            runner_token: runner_token.into(),
            runner_name: runner_name.into(),
            job_id,
        }
    }

    /// Labels shared by every resource of this job
    pub fn base(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_RUNNER.to_string(), self.runner_token.clone()),
            (LABEL_RUNNER_NAME.to_string(), self.runner_name.clone()),
            (LABEL_JOB_ID.to_string(), self.job_id.to_string()),
        ])
    }

    /// Labels a container spec before creation
    pub fn label(&self, spec: &mut ContainerSpec, kind: ContainerKind, extra: &[(&str, &str)]) {
        spec.labels.extend(self.base());
        spec.labels.insert(LABEL_TYPE.to_string(), kind.as_str().to_string());
        for (key, value) in extra {
            spec.labels.insert((*key).to_string(), (*value).to_string());
        }
    }

    /// Labels matching everything this runner created, across all jobs
    pub fn runner_filter(runner_token: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_RUNNER.to_string(), runner_token.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_sets_ownership_and_type() {
        let job_id = Uuid::new_v4();
        let labeler = Labeler::new("abcd1234", "runner-1", job_id);
        let mut spec = ContainerSpec::default();

        labeler.label(&mut spec, ContainerKind::Cache, &[(LABEL_CACHE_DIR, "/cache")]);

        assert_eq!(spec.labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(LABEL_RUNNER).map(String::as_str), Some("abcd1234"));
        assert_eq!(spec.labels.get(LABEL_JOB_ID), Some(&job_id.to_string()));
        assert_eq!(spec.labels.get(LABEL_TYPE).map(String::as_str), Some("cache"));
        assert_eq!(spec.labels.get(LABEL_CACHE_DIR).map(String::as_str), Some("/cache"));
    }

    #[test]
    fn test_runner_filter_is_subset_of_base() {
        let labeler = Labeler::new("abcd1234", "runner-1", Uuid::new_v4());
        let base = labeler.base();
        for (key, value) in Labeler::runner_filter("abcd1234") {
            assert_eq!(base.get(&key), Some(&value));
        }
    }
}
