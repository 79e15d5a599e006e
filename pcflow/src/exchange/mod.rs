//! Handing publisher container addresses to the partner.
//!
//! The publisher `put`s the addresses of its joint-stage containers under a
//! well-known key; the partner `wait`s on the same key before launching its
//! own side.

mod file;
mod memory;

pub use file::FileAddressExchange;
pub use memory::InMemoryAddressExchange;

use crate::core::Phase;
use crate::errors::ExchangeError;
use async_trait::async_trait;
use std::time::Duration;

/// Key/value put-and-wait for address lists.
#[async_trait]
pub trait AddressExchange: Send + Sync {
    /// Publishes `addresses` under `key`, replacing any previous value.
    async fn put(&self, key: &str, addresses: &[String]) -> Result<(), ExchangeError>;

    /// Waits until `key` holds a non-empty address list.
    async fn wait(&self, key: &str, timeout: Duration) -> Result<Vec<String>, ExchangeError>;
}

/// Exchange key for a joint phase: `{instance_id}/{phase}`.
#[must_use]
pub fn phase_key(instance_id: &str, phase: Phase) -> String {
    format!("{instance_id}/{phase}")
}
