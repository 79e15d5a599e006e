//! Persistence of computation instances.
//!
//! [`InstanceStore`] is the raw keyed storage; [`InstanceRepository`] layers
//! per-instance locking on top so a read-modify-persist sequence for one
//! instance never interleaves with another for the same id.

mod file;
mod memory;
mod repository;

pub use file::JsonFileInstanceStore;
pub use memory::InMemoryInstanceStore;
pub use repository::InstanceRepository;

use crate::core::ComputationInstance;
use crate::errors::StoreError;
use async_trait::async_trait;

/// Keyed storage of [`ComputationInstance`]s.
///
/// Implementations do not lock across calls; callers that read, mutate and
/// write back go through [`InstanceRepository`].
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Stores a new instance; fails if the id exists.
    async fn create(&self, instance: &ComputationInstance) -> Result<(), StoreError>;

    /// Reads an instance by id.
    async fn read(&self, instance_id: &str) -> Result<ComputationInstance, StoreError>;

    /// Overwrites an existing instance.
    async fn update(&self, instance: &ComputationInstance) -> Result<(), StoreError>;

    /// Removes an instance.
    async fn delete(&self, instance_id: &str) -> Result<(), StoreError>;
}
