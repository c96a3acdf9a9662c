//! Temporary resource registry
//!
//! Collects the identifiers of every container and network created during
//! one run so teardown can remove them whatever the outcome. Identifiers are
//! recorded right after creation, before any call that may block, so a run
//! interrupted mid-operation still cleans up what it created.

use std::sync::Mutex;

/// A backend resource owned by the current run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempResource {
    Container(String),
    Network(String),
}

/// Concurrency-safe set of resources to destroy at the end of a run
#[derive(Debug, Default)]
pub struct TempResources {
    items: Mutex<Vec<TempResource>>,
}

impl TempResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resource for teardown
    pub fn append(&self, resource: TempResource) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if !items.contains(&resource) {
            items.push(resource);
        }
    }

    pub fn append_container(&self, id: impl Into<String>) {
        self.append(TempResource::Container(id.into()));
    }

    pub fn append_network(&self, id: impl Into<String>) {
        self.append(TempResource::Network(id.into()));
    }

    /// Stops tracking a resource that was already removed or that must outlive the run
    ///
    /// Returns whether the resource was tracked.
    pub fn release(&self, resource: &TempResource) -> bool {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let before = items.len();
        items.retain(|r| r != resource);
        items.len() != before
    }

    /// Returns all tracked resources and clears the registry
    ///
    /// A second call returns an empty list.
    pub fn drain(&self) -> Vec<TempResource> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drain_is_idempotent() {
        let registry = TempResources::new();
        registry.append_container("a");
        registry.append_network("net");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.contains(&TempResource::Container("a".to_string())));
        assert!(drained.contains(&TempResource::Network("net".to_string())));

        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_duplicate_append_is_recorded_once() {
        let registry = TempResources::new();
        registry.append_container("a");
        registry.append_container("a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release() {
        let registry = TempResources::new();
        registry.append_container("cache");
        registry.append_container("step");

        assert!(registry.release(&TempResource::Container("cache".to_string())));
        assert!(!registry.release(&TempResource::Container("cache".to_string())));
        assert_eq!(registry.drain(), vec![TempResource::Container("step".to_string())]);
    }

    #[tokio::test]
    async fn test_concurrent_append() {
        let registry = Arc::new(TempResources::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.append_container(format!("c{}", i));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.drain().len(), 16);
        assert!(registry.is_empty());
    }
}
