//! Resource directory contract.

use super::types::ContainerResource;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Looks up the registered container resource for `container_id`.
    async fn find_container(&self, container_id: &str) -> Result<Option<ContainerResource>>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    containers: DashMap<String, ContainerResource>,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, resource: ContainerResource) {
        self.containers
            .insert(resource.container_id.clone(), resource);
    }
}

#[async_trait]
impl ResourceDirectory for InMemoryDirectory {
    async fn find_container(&self, container_id: &str) -> Result<Option<ContainerResource>> {
        Ok(self
            .containers
            .get(container_id)
            .map(|entry| entry.value().clone()))
    }
}
