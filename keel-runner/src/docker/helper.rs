//! Helper image resolution
//!
//! The helper image carries the small utility binary used for sources, cache
//! and artifact stages. It is resolved once per process and shared by every
//! run. Pulls of the helper image are retried on transient failures.
//!
//! Helper images older than the `cache-init` subcommand only ship the
//! standalone `keel-cache` binary; callers pick the matching command form.

use keel_core::domain::runner::PullPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{ContainerBackend, ImageInfo};
use crate::error::BackendError;
use crate::signal::RunSignal;

/// Image label carrying the helper version
pub const HELPER_VERSION_LABEL: &str = "dev.keel.helper.version";

/// First helper release shipping `keel-helper cache-init`
const CACHE_INIT_SINCE: (u64, u64) = (1, 4);

/// Which command interface the helper image understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperCommandForm {
    Legacy,
    Current,
}

impl HelperCommandForm {
    /// Picks the form from the image's version label
    ///
    /// Images without a readable version label are assumed current.
    pub fn from_version(version: Option<&str>) -> Self {
        match version.and_then(parse_major_minor) {
            Some(version) if version < CACHE_INIT_SINCE => HelperCommandForm::Legacy,
            _ => HelperCommandForm::Current,
        }
    }

    /// Entrypoint command initialising a cache container volume at `path`
    pub fn cache_init(self, path: &str) -> Vec<String> {
        match self {
            HelperCommandForm::Legacy => vec!["keel-cache".to_string(), path.to_string()],
            HelperCommandForm::Current => vec![
                "keel-helper".to_string(),
                "cache-init".to_string(),
                path.to_string(),
            ],
        }
    }
}

fn parse_major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()
        .unwrap_or("0")
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    Some((major, minor.parse().ok()?))
}

/// A resolved helper image
#[derive(Debug, Clone)]
pub struct HelperImage {
    pub name: String,
    pub id: String,
    pub version: Option<String>,
    pub form: HelperCommandForm,
}

impl HelperImage {
    pub fn is_outdated(&self) -> bool {
        self.form == HelperCommandForm::Legacy
    }
}

/// Bounded exponential backoff for transient pull failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Makes sure `name` is available locally according to the pull policy
pub async fn ensure_image(
    backend: &dyn ContainerBackend,
    name: &str,
    policy: PullPolicy,
    retry: RetryPolicy,
    signal: &RunSignal,
) -> Result<ImageInfo, BackendError> {
    match policy {
        PullPolicy::Never => {
            return signal.guard(backend.inspect_image(name)).await?.map_err(|e| match e {
                BackendError::ImageNotFound(msg) => BackendError::ImageNotFound(format!(
                    "{} (pull policy is never): {}",
                    name, msg
                )),
                other => other,
            });
        }
        PullPolicy::IfNotPresent => match signal.guard(backend.inspect_image(name)).await? {
            Ok(info) => {
                debug!("Using locally found image {}", name);
                return Ok(info);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        },
        PullPolicy::Always => {}
    }

    pull_with_retry(backend, name, retry, signal).await?;
    signal.guard(backend.inspect_image(name)).await?
}

async fn pull_with_retry(
    backend: &dyn ContainerBackend,
    name: &str,
    retry: RetryPolicy,
    signal: &RunSignal,
) -> Result<(), BackendError> {
    let mut attempt = 0;
    let mut delay = retry.initial_delay;

    loop {
        attempt += 1;

        match signal.guard(backend.pull_image(name)).await? {
            Ok(()) => {
                if attempt > 1 {
                    info!("Pulled image {} after {} attempt(s)", name, attempt);
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                warn!(
                    "Failed to pull image {} (attempt {}/{}): {}",
                    name, attempt, retry.max_attempts, e
                );
                signal.guard(tokio::time::sleep(delay)).await?;
                delay = (delay * 2).min(retry.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolves the helper image once and shares the result
pub struct HelperImageResolver {
    backend: Arc<dyn ContainerBackend>,
    image: String,
    pull_policy: PullPolicy,
    retry: RetryPolicy,
    resolved: OnceCell<HelperImage>,
}

impl HelperImageResolver {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        image: impl Into<String>,
        pull_policy: PullPolicy,
    ) -> Self {
        Self {
            backend,
            image: image.into(),
            pull_policy,
            retry: RetryPolicy::default(),
            resolved: OnceCell::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Returns the helper image, pulling it on first use
    ///
    /// A failed resolution is not cached; the next call tries again. Waiting
    /// on a pull started by another run still observes this run's signal.
    pub async fn resolve(&self, signal: &RunSignal) -> Result<HelperImage, BackendError> {
        let init = self.resolved.get_or_try_init(|| async {
            let info = ensure_image(
                self.backend.as_ref(),
                &self.image,
                self.pull_policy,
                self.retry,
                signal,
            )
            .await?;

            let version = info.labels.get(HELPER_VERSION_LABEL).cloned();
            let form = HelperCommandForm::from_version(version.as_deref());
            info!(
                "Resolved helper image {} ({}), version {}",
                self.image,
                info.id,
                version.as_deref().unwrap_or("unknown")
            );

            Ok::<_, BackendError>(HelperImage {
                name: self.image.clone(),
                id: info.id,
                version,
                form,
            })
        });

        signal.guard(init).await?.cloned()
    }
}
