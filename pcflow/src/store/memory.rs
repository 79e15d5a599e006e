use super::InstanceStore;
use crate::core::ComputationInstance;
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local store, used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<String, ComputationInstance>>,
}

impl InMemoryInstanceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.instance_id) {
            return Err(StoreError::AlreadyExists(instance.instance_id.clone()));
        }
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn read(&self, instance_id: &str) -> Result<ComputationInstance, StoreError> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))
    }

    async fn update(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        match instances.get_mut(&instance.instance_id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(instance.instance_id.clone())),
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<(), StoreError> {
        self.instances
            .write()
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(instance_id.to_string()))
    }
}
