//! Container lifecycle supervision.
//!
//! This module provides:
//! - The [`ContainerBackend`] collaborator trait
//! - Binary version resolution
//! - Bounded retry with backoff for throttled starts
//! - The [`ContainerSupervisor`] that starts, polls, stops and aggregates containers

mod backend;
mod resolver;
mod retry;
mod supervisor;

pub use backend::{ContainerBackend, StartRequest};
#[cfg(test)]
pub use backend::MockContainerBackend;
pub use resolver::{BinaryInfo, BinaryResolver, StaticBinaryResolver};
pub use retry::{retry_with_backoff, BackoffStrategy, JitterStrategy, RetryConfig};
pub use supervisor::{aggregate_status, ContainerSupervisor};
