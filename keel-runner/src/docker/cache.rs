//! Cache container management
//!
//! A cache container is a long-lived container of the helper image whose only
//! job is to own a volume at a given path. It is found again by its
//! deterministic name on later runs, so the same name always means the same
//! storage. Job containers mount it with `--volumes-from`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::labels::LABEL_CACHE_DIR;
use crate::backend::{ContainerBackend, ContainerKind, ContainerSpec, Labeler};
use crate::docker::helper::HelperImageResolver;
use crate::docker::registry::{TempResource, TempResources};
use crate::error::BackendError;
use crate::signal::RunSignal;

/// Finds or creates cache containers
pub struct CacheContainerManager {
    backend: Arc<dyn ContainerBackend>,
    helper: Arc<HelperImageResolver>,
    labeler: Labeler,
    registry: Arc<TempResources>,
}

impl CacheContainerManager {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        helper: Arc<HelperImageResolver>,
        labeler: Labeler,
        registry: Arc<TempResources>,
    ) -> Self {
        Self {
            backend,
            helper,
            labeler,
            registry,
        }
    }

    /// Returns the id of a cache container for `path`, creating it if needed
    pub async fn ensure(
        &self,
        name: &str,
        path: &str,
        signal: &RunSignal,
    ) -> Result<String, BackendError> {
        if let Some(id) = self.find_existing(name, path, signal).await? {
            debug!("Reusing cache container {} for {}", id, path);
            return Ok(id);
        }
        self.create_and_start(name, path, signal).await
    }

    /// Looks up the cache container `name`
    ///
    /// A container that exists but does not mount `path` is stale: it is
    /// removed (best effort) and reported as not found. Removal failures are
    /// only logged; a replacement is then attempted regardless.
    pub async fn find_existing(
        &self,
        name: &str,
        path: &str,
        signal: &RunSignal,
    ) -> Result<Option<String>, BackendError> {
        let inspected = match signal.guard(self.backend.inspect_container(name)).await? {
            Ok(inspected) => inspected,
            Err(e) => {
                debug!("No usable cache container {}: {}", name, e);
                return Ok(None);
            }
        };

        if !inspected.volumes.iter().any(|v| v == path) {
            debug!("Removing broken cache container for {:?} path", path);
            let result = signal
                .guard(self.backend.remove_container(&inspected.id))
                .await?;
            match result {
                Ok(()) => debug!("Cache container for {:?} path removed", path),
                Err(e) => warn!("Cache container for {:?} path not removed: {}", path, e),
            }
            return Ok(None);
        }

        Ok(Some(inspected.id))
    }

    /// Creates the cache container, starts it and waits for its volume to be initialised
    ///
    /// The container is tracked for cleanup from creation until it is ready,
    /// so a failure or interruption in between removes it again. Once ready
    /// it is released from the registry and outlives the run.
    pub async fn create_and_start(
        &self,
        name: &str,
        path: &str,
        signal: &RunSignal,
    ) -> Result<String, BackendError> {
        let helper = self.helper.resolve(signal).await?;
        if helper.is_outdated() {
            debug!("Falling back to old keel-cache command");
        }

        let mut spec = ContainerSpec {
            name: name.to_string(),
            image: helper.id.clone(),
            cmd: helper.form.cache_init(path),
            volumes: vec![path.to_string()],
            ..Default::default()
        };
        self.labeler
            .label(&mut spec, ContainerKind::Cache, &[(LABEL_CACHE_DIR, path)]);

        let id = match signal.guard(self.backend.create_container(&spec)).await {
            Ok(result) => result?,
            Err(interrupt) => {
                // The backend may have created it anyway; remove it by name
                self.registry.append_container(name);
                return Err(interrupt.into());
            }
        };
        self.registry.append_container(&id);

        debug!("Starting cache container {:?}...", id);
        signal.guard(self.backend.start_container(&id)).await??;

        debug!("Waiting for cache container {:?}...", id);
        let exit_code = signal.guard(self.backend.wait_container(&id)).await??;
        if exit_code != 0 {
            return Err(BackendError::Unavailable(format!(
                "cache container {} exited with code {}",
                name, exit_code
            )));
        }

        self.registry.release(&TempResource::Container(id.clone()));
        info!("Created cache container {} for {}", name, path);
        Ok(id)
    }
}
