use super::InstanceStore;
use crate::core::ComputationInstance;
use crate::errors::StoreError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

/// Read-modify-persist access to instances, serialized per instance id.
///
/// The lock covers only the local closure and the store calls around it.
/// Closures are synchronous, so no container backend call can run while a
/// lock is held.
#[derive(Clone)]
pub struct InstanceRepository {
    store: Arc<dyn InstanceStore>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for InstanceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRepository")
            .field("locked_ids", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl InstanceRepository {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once no other caller holds or awaits it.
    fn release(&self, instance_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Persists a new instance.
    pub async fn create(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        let lock = self.lock_for(&instance.instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.store.create(instance).await
        };
        self.release(&instance.instance_id, lock);
        result
    }

    /// Reads the current snapshot.
    pub async fn read(&self, instance_id: &str) -> Result<ComputationInstance, StoreError> {
        self.store.read(instance_id).await
    }

    /// Deletes an instance.
    pub async fn delete(&self, instance_id: &str) -> Result<(), StoreError> {
        let lock = self.lock_for(instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.store.delete(instance_id).await
        };
        self.release(instance_id, lock);
        result
    }

    /// Applies `mutate` to the stored instance and persists the result.
    pub async fn update<F>(&self, instance_id: &str, mutate: F) -> Result<ComputationInstance, StoreError>
    where
        F: FnOnce(&mut ComputationInstance) + Send,
    {
        self.try_update(instance_id, |instance| {
            mutate(instance);
            Ok::<(), StoreError>(())
        })
        .await
        .map(|(instance, ())| instance)
    }

    /// Like [`update`](Self::update), but `mutate` may reject the change.
    ///
    /// Nothing is persisted when `mutate` returns an error. The error type
    /// is the closure's; it only needs to absorb [`StoreError`].
    pub async fn try_update<F, T, E>(
        &self,
        instance_id: &str,
        mutate: F,
    ) -> Result<(ComputationInstance, T), E>
    where
        F: FnOnce(&mut ComputationInstance) -> Result<T, E> + Send,
        E: From<StoreError>,
    {
        let lock = self.lock_for(instance_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(instance_id, mutate).await
        };
        self.release(instance_id, lock);
        result
    }

    async fn apply<F, T, E>(&self, instance_id: &str, mutate: F) -> Result<(ComputationInstance, T), E>
    where
        F: FnOnce(&mut ComputationInstance) -> Result<T, E> + Send,
        E: From<StoreError>,
    {
        let mut instance = self.store.read(instance_id).await?;
        let value = mutate(&mut instance)?;
        instance.touch();
        self.store.update(&instance).await?;
        trace!(instance_id = %instance_id, status = %instance.status, "Persisted instance");
        Ok((instance, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InstanceStatus, Protocol, Role};
    use crate::errors::{InvalidStateError, PcflowError};
    use crate::core::Phase;
    use crate::store::InMemoryInstanceStore;

    async fn repository() -> InstanceRepository {
        let repo = InstanceRepository::new(Arc::new(InMemoryInstanceStore::new()));
        repo.create(&ComputationInstance::new("run-1", Role::Publisher, Protocol::UnionPid))
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_update_persists() {
        let repo = repository().await;
        let updated = repo
            .update("run-1", |i| i.status = InstanceStatus::IdMatchStarted)
            .await
            .unwrap();

        assert_eq!(updated.status, InstanceStatus::IdMatchStarted);
        assert_eq!(repo.read("run-1").await.unwrap().status, InstanceStatus::IdMatchStarted);
    }

    #[tokio::test]
    async fn test_rejected_update_is_not_persisted() {
        let repo = repository().await;
        let err = repo
            .try_update("run-1", |i| {
                i.retry_counter = 9;
                Err::<(), PcflowError>(
                    InvalidStateError {
                        current: i.status,
                        target: Phase::Compute,
                        reason: "nope".to_string(),
                    }
                    .into(),
                )
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PcflowError::InvalidState(_)));
        assert_eq!(repo.read("run-1").await.unwrap().retry_counter, 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let repo = repository().await;
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.update("run-1", |i| i.retry_counter += 1).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(repo.read("run-1").await.unwrap().retry_counter, 20);
        assert!(repo.locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_instance() {
        let repo = repository().await;
        let err = repo.update("ghost", |_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
