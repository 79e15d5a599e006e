//! Starting, polling, stopping and aggregating remote containers.

use super::{retry_with_backoff, BinaryResolver, ContainerBackend, RetryConfig, StartRequest};
use crate::core::{ContainerInstance, ContainerStatus, StageStatus};
use crate::errors::ContainerError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Derives a stage status from its containers.
///
/// Any failed container fails the stage; otherwise the stage is completed
/// only when every container completed, started when any is still running,
/// and unknown otherwise (including when there are no containers).
#[must_use]
pub fn aggregate_status(containers: &[ContainerInstance]) -> StageStatus {
    let statuses: Vec<ContainerStatus> = containers.iter().map(|c| c.status).collect();

    if statuses.contains(&ContainerStatus::Failed) {
        StageStatus::Failed
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == ContainerStatus::Completed) {
        StageStatus::Completed
    } else if statuses.contains(&ContainerStatus::Started) {
        StageStatus::Started
    } else {
        StageStatus::Unknown
    }
}

/// Drives container fleets through the [`ContainerBackend`].
#[derive(Clone)]
pub struct ContainerSupervisor {
    backend: Arc<dyn ContainerBackend>,
    resolver: Arc<dyn BinaryResolver>,
    start_retry: RetryConfig,
}

impl std::fmt::Debug for ContainerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSupervisor")
            .field("start_retry", &self.start_retry)
            .finish_non_exhaustive()
    }
}

impl ContainerSupervisor {
    /// Creates a supervisor with the default throttling retry.
    #[must_use]
    pub fn new(backend: Arc<dyn ContainerBackend>, resolver: Arc<dyn BinaryResolver>) -> Self {
        Self {
            backend,
            resolver,
            start_retry: RetryConfig::default(),
        }
    }

    /// Overrides the retry applied to throttled starts.
    #[must_use]
    pub fn with_start_retry(mut self, retry: RetryConfig) -> Self {
        self.start_retry = retry;
        self
    }

    /// Starts one container per command line.
    ///
    /// A throttling error is retried after the configured backoff; any other
    /// error is returned immediately.
    pub async fn start(
        &self,
        binary_name: &str,
        cmd_args: Vec<String>,
        timeout: Duration,
        env: HashMap<String, String>,
    ) -> Result<Vec<ContainerInstance>, ContainerError> {
        let binary = self.resolver.resolve(binary_name)?;
        let request = StartRequest {
            binary_name: binary_name.to_string(),
            version: binary.version,
            cmd_args,
            timeout,
            env,
        };

        let containers = retry_with_backoff(
            &self.start_retry,
            binary_name,
            ContainerError::is_throttling,
            || self.backend.start_containers(&request),
        )
        .await?;

        info!(
            binary = %binary_name,
            version = %request.version,
            count = containers.len(),
            "Started containers"
        );
        Ok(containers)
    }

    /// Polls each container, in order, until it is terminal.
    ///
    /// The first container observed as failed ends the wait immediately; the
    /// containers after it keep their last-seen status.
    pub async fn wait_until_terminal(
        &self,
        containers: Vec<ContainerInstance>,
        poll_interval: Duration,
    ) -> Result<Vec<ContainerInstance>, ContainerError> {
        let mut observed = containers;

        for idx in 0..observed.len() {
            self.poll_one(&mut observed[idx]).await?;
            while !observed[idx].status.is_terminal() {
                tokio::time::sleep(poll_interval).await;
                self.poll_one(&mut observed[idx]).await?;
            }

            if observed[idx].status == ContainerStatus::Failed {
                warn!(
                    container_id = %observed[idx].id,
                    remaining = observed.len() - idx - 1,
                    "Container failed; not waiting on the rest"
                );
                break;
            }
        }

        Ok(observed)
    }

    /// [`wait_until_terminal`](Self::wait_until_terminal) bounded by `timeout`.
    pub async fn wait_until_terminal_with_timeout(
        &self,
        containers: Vec<ContainerInstance>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Vec<ContainerInstance>, ContainerError> {
        let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
        match tokio::time::timeout(timeout, self.wait_until_terminal(containers, poll_interval)).await
        {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout {
                ids,
                timeout_seconds: timeout.as_secs(),
            }),
        }
    }

    /// One poll pass over all containers.
    ///
    /// Order is preserved; containers the backend does not report keep their
    /// previous snapshot.
    pub async fn refresh(
        &self,
        containers: &[ContainerInstance],
    ) -> Result<Vec<ContainerInstance>, ContainerError> {
        if containers.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
        let mut fresh: HashMap<String, ContainerInstance> = self
            .backend
            .poll(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        Ok(containers
            .iter()
            .map(|c| fresh.remove(&c.id).unwrap_or_else(|| c.clone()))
            .collect())
    }

    /// Stops containers, logging any per-container failure.
    ///
    /// Returns the number of containers that could not be stopped.
    pub async fn stop(&self, containers: &[ContainerInstance]) -> usize {
        let ids: Vec<String> = containers
            .iter()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.id.clone())
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let results = self.backend.stop(&ids).await;
        let mut failures = 0;
        for (id, result) in ids.iter().zip(results) {
            if let Some(err) = result {
                failures += 1;
                warn!(container_id = %id, error = %err, "Failed to stop container");
            }
        }
        info!(requested = ids.len(), failures, "Stopped containers");
        failures
    }

    async fn poll_one(&self, container: &mut ContainerInstance) -> Result<(), ContainerError> {
        let polled = self.backend.poll(std::slice::from_ref(&container.id)).await?;
        match polled.into_iter().find(|c| c.id == container.id) {
            Some(fresh) => {
                debug!(container_id = %fresh.id, status = %fresh.status, "Polled container");
                *container = fresh;
            }
            None => {
                debug!(container_id = %container.id, "Backend did not report container");
            }
        }
        Ok(())
    }
}
