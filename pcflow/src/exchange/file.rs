use super::AddressExchange;
use crate::errors::ExchangeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct AddressFile {
    addresses: Vec<String>,
    published_at: chrono::DateTime<chrono::Utc>,
}

/// Exchange through JSON files in a directory both parties can read.
///
/// Keys map to `{dir}/{key with '/' as '__'}.json`. `wait` polls the file.
#[derive(Debug, Clone)]
pub struct FileAddressExchange {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileAddressExchange {
    /// Uses `dir` with a one second poll.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace('/', "__")))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<String>>, ExchangeError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(raw) => {
                let file: AddressFile = serde_json::from_slice(&raw)?;
                Ok(Some(file.addresses))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AddressExchange for FileAddressExchange {
    async fn put(&self, key: &str, addresses: &[String]) -> Result<(), ExchangeError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(&AddressFile {
            addresses: addresses.to_vec(),
            published_at: chrono::Utc::now(),
        })?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key = %key, count = addresses.len(), "Published addresses");
        Ok(())
    }

    async fn wait(&self, key: &str, timeout: Duration) -> Result<Vec<String>, ExchangeError> {
        let poll = async {
            loop {
                match self.read(key).await? {
                    Some(addresses) if !addresses.is_empty() => {
                        return Ok::<_, ExchangeError>(addresses)
                    }
                    _ => tokio::time::sleep(self.poll_interval).await,
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or_else(|_| {
                Err(ExchangeError::Timeout {
                    key: key.to_string(),
                    timeout_seconds: timeout.as_secs(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_wait() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = FileAddressExchange::new(dir.path()).with_poll_interval(Duration::from_millis(5));

        exchange.put("run-1/compute", &["10.0.0.7".to_string()]).await.unwrap();
        assert!(dir.path().join("run-1__compute.json").exists());

        let addrs = exchange.wait("run-1/compute", Duration::from_secs(1)).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.7".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = FileAddressExchange::new(dir.path()).with_poll_interval(Duration::from_millis(5));

        let err = exchange.wait("nothing", Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout { .. }));
    }
}
