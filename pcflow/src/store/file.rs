use super::InstanceStore;
use crate::core::ComputationInstance;
use crate::errors::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One pretty-printed JSON document per instance under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileInstanceStore {
    root: PathBuf,
}

impl JsonFileInstanceStore {
    /// Uses `root`, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `[A-Za-z0-9-]` is kept; every other byte becomes `_XX`, so distinct
    /// ids never share a file.
    fn path_for(&self, instance_id: &str) -> PathBuf {
        let mut file_name = String::with_capacity(instance_id.len());
        for byte in instance_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("_{byte:02X}"));
            }
        }
        self.root.join(format!("{file_name}.json"))
    }

    async fn write(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        let path = self.path_for(&instance.instance_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(instance)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for JsonFileInstanceStore {
    async fn create(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        if tokio::fs::try_exists(self.path_for(&instance.instance_id)).await? {
            return Err(StoreError::AlreadyExists(instance.instance_id.clone()));
        }
        self.write(instance).await
    }

    async fn read(&self, instance_id: &str) -> Result<ComputationInstance, StoreError> {
        match tokio::fs::read(self.path_for(instance_id)).await {
            Ok(raw) => {
                let instance: ComputationInstance = serde_json::from_slice(&raw)?;
                if instance.instance_id != instance_id {
                    return Err(StoreError::IdMismatch {
                        requested: instance_id.to_string(),
                        found: instance.instance_id,
                    });
                }
                Ok(instance)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(instance_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, instance: &ComputationInstance) -> Result<(), StoreError> {
        if !tokio::fs::try_exists(self.path_for(&instance.instance_id)).await? {
            return Err(StoreError::NotFound(instance.instance_id.clone()));
        }
        self.write(instance).await
    }

    async fn delete(&self, instance_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(instance_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(instance_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
