use super::AddressExchange;
use crate::errors::ExchangeError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

/// In-process exchange for two parties driven from one process (tests, demos).
#[derive(Debug, Default)]
pub struct InMemoryAddressExchange {
    slots: DashMap<String, watch::Sender<Vec<String>>>,
}

impl InMemoryAddressExchange {
    /// Creates an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, key: &str) -> watch::Receiver<Vec<String>> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }

    /// Current value under `key`, empty if never published.
    #[must_use]
    pub fn peek(&self, key: &str) -> Vec<String> {
        self.slots
            .get(key)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AddressExchange for InMemoryAddressExchange {
    async fn put(&self, key: &str, addresses: &[String]) -> Result<(), ExchangeError> {
        let tx = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0);
        tx.send_replace(addresses.to_vec());
        Ok(())
    }

    async fn wait(&self, key: &str, timeout: Duration) -> Result<Vec<String>, ExchangeError> {
        let mut rx = self.subscribe(key);
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|addrs| !addrs.is_empty())
                .await
                .map(|addrs| addrs.clone())
        })
        .await;

        match waited {
            Ok(Ok(addresses)) => Ok(addresses),
            // The sender lives in `slots` for as long as `self`, so a closed
            // channel can only mean the value never arrived.
            Ok(Err(_)) | Err(_) => Err(ExchangeError::Timeout {
                key: key.to_string(),
                timeout_seconds: timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_returns_published_value() {
        let exchange = InMemoryAddressExchange::new();
        exchange.put("run-1/compute", &["10.0.0.1".to_string()]).await.unwrap();

        let addrs = exchange.wait("run-1/compute", Duration::from_millis(10)).await.unwrap();
        assert_eq!(addrs, vec!["10.0.0.1".to_string()]);
        assert_eq!(exchange.peek("run-1/compute"), addrs);
    }

    #[tokio::test]
    async fn test_wait_sees_later_put() {
        let exchange = Arc::new(InMemoryAddressExchange::new());
        let waiter = {
            let exchange = exchange.clone();
            tokio::spawn(async move { exchange.wait("k", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        exchange.put("k", &["a".to_string(), "b".to_string()]).await.unwrap();

        let addrs = waiter.await.unwrap().unwrap();
        assert_eq!(addrs, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let exchange = InMemoryAddressExchange::new();
        let err = exchange.wait("missing", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout { key, .. } if key == "missing"));
    }
}
