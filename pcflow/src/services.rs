//! The collaborators shared by the dispatcher and the orchestrator.

use crate::config::OrchestratorConfig;
use crate::container::{BinaryResolver, ContainerBackend, ContainerSupervisor};
use crate::events::{EventSink, LoggingEventSink};
use crate::exchange::{AddressExchange, InMemoryAddressExchange};
use crate::graph::FlowTable;
use crate::store::{InMemoryInstanceStore, InstanceRepository, InstanceStore};
use std::sync::Arc;

/// Everything a phase or stage run needs, cheap to clone.
#[derive(Clone)]
pub struct Services {
    /// Locked access to persisted instances.
    pub repository: InstanceRepository,
    /// Container lifecycle.
    pub supervisor: ContainerSupervisor,
    /// Address hand-off between the parties.
    pub exchange: Arc<dyn AddressExchange>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventSink>,
    /// Id-match stage flows.
    pub flows: Arc<FlowTable>,
    /// Runtime configuration.
    pub config: Arc<OrchestratorConfig>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("repository", &self.repository)
            .field("supervisor", &self.supervisor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Starts a builder around a container backend.
    #[must_use]
    pub fn builder(backend: Arc<dyn ContainerBackend>) -> ServicesBuilder {
        ServicesBuilder::new(backend)
    }
}

/// Builder for [`Services`].
///
/// Unset collaborators default to in-memory stores, a logging event sink, the
/// standard flow table and a resolver over the configured binaries.
pub struct ServicesBuilder {
    backend: Arc<dyn ContainerBackend>,
    config: OrchestratorConfig,
    store: Option<Arc<dyn InstanceStore>>,
    resolver: Option<Arc<dyn BinaryResolver>>,
    exchange: Option<Arc<dyn AddressExchange>>,
    events: Option<Arc<dyn EventSink>>,
    flows: Option<FlowTable>,
}

impl ServicesBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            backend,
            config: OrchestratorConfig::default(),
            store: None,
            resolver: None,
            exchange: None,
            events: None,
            flows: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the instance store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the binary resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn BinaryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the address exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: Arc<dyn AddressExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the flow table.
    #[must_use]
    pub fn with_flows(mut self, flows: FlowTable) -> Self {
        self.flows = Some(flows);
        self
    }

    /// Builds the services.
    #[must_use]
    pub fn build(self) -> Services {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(self.config.binary_resolver()));
        let supervisor = ContainerSupervisor::new(self.backend, resolver)
            .with_start_retry(self.config.start_retry());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryInstanceStore::new()));

        Services {
            repository: InstanceRepository::new(store),
            supervisor,
            exchange: self
                .exchange
                .unwrap_or_else(|| Arc::new(InMemoryAddressExchange::new())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(LoggingEventSink::default())),
            flows: Arc::new(self.flows.unwrap_or_else(FlowTable::standard)),
            config: Arc::new(self.config),
        }
    }
}
