//! Ready-made instances, configuration and services for tests.

use crate::config::OrchestratorConfig;
use crate::container::ContainerBackend;
use crate::core::{ComputationInstance, Protocol, Role};
use crate::events::CollectingEventSink;
use crate::services::Services;
use std::sync::Arc;

/// A publisher instance with two shards and two containers per phase.
#[must_use]
pub fn publisher_instance(instance_id: &str) -> ComputationInstance {
    instance(instance_id, Role::Publisher)
}

/// A partner instance with two shards and two containers per phase.
#[must_use]
pub fn partner_instance(instance_id: &str) -> ComputationInstance {
    instance(instance_id, Role::Partner)
}

fn instance(instance_id: &str, role: Role) -> ComputationInstance {
    ComputationInstance::new(instance_id, role, Protocol::UnionPid)
        .with_input_path(format!("/data/in/{instance_id}_{}.csv", role.file_token()))
        .with_output_dir("/data/out")
        .with_num_shards(2)
        .with_num_containers(2)
}

/// Configuration with millisecond polls and backoffs.
#[must_use]
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_poll_interval_seconds(0.001)
        .with_throttle_backoff_seconds(0.001)
        .with_address_wait_seconds(1.0)
}

/// In-memory services over `backend` with [`test_config`].
pub fn test_services(backend: Arc<dyn ContainerBackend>) -> (Services, Arc<CollectingEventSink>) {
    test_services_with(backend, test_config())
}

/// In-memory services over `backend` with a custom configuration.
pub fn test_services_with(
    backend: Arc<dyn ContainerBackend>,
    config: OrchestratorConfig,
) -> (Services, Arc<CollectingEventSink>) {
    let events = Arc::new(CollectingEventSink::new());
    let services = Services::builder(backend)
        .with_config(config)
        .with_events(events.clone())
        .build();
    (services, events)
}
