//! # pcflow
//!
//! Stage orchestration for two-party private computation runs.
//!
//! A publisher and a partner each drive their own copy of this engine. Every
//! run moves through a fixed sequence of phases (id matching, data
//! preparation, joint computation, aggregation, post-processing), each of
//! which launches fleets of remote containers.
//!
//! The crate is organised around three pieces:
//!
//! - **Stage graph dispatch**: the id-matching phase is itself a small DAG of
//!   stages (shard, prepare, run PID) executed in waves with output paths
//!   propagated from each stage to its successors.
//! - **Container supervision**: starting, polling, stopping and aggregating
//!   the status of remote containers, with a bounded retry on throttling.
//! - **Phase flow**: a per-party state machine that validates phase
//!   transitions, tracks explicit retry counters, re-runs only the failed
//!   containers of a phase when asked to, and cancels in-flight work.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pcflow::prelude::*;
//!
//! let services = Services::builder(backend).build();
//! let orchestrator = Orchestrator::new(services);
//!
//! orchestrator.create_instance(
//!     ComputationInstance::new("run-1", Role::Publisher, Protocol::UnionPid)
//!         .with_input_path("/data/run-1/input.csv")
//!         .with_output_dir("/data/run-1/out")
//!         .with_num_shards(4),
//! ).await?;
//!
//! orchestrator.run_phase("run-1", Phase::IdMatch, RunPhaseOptions::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod container;
pub mod core;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod flow;
pub mod graph;
pub mod observability;
pub mod services;
pub mod store;
pub mod testing;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::container::{
        aggregate_status, BinaryResolver, ContainerBackend, ContainerSupervisor,
        StartRequest, StaticBinaryResolver,
    };
    pub use crate::core::{
        ComputationInstance, ContainerInstance, ContainerStatus, GameArgs,
        InstanceStatus, Phase, Protocol, Role, StageKind, StageStatus, SubInstance,
    };
    pub use crate::errors::{
        CancelInvariantError, ContainerError, InvalidStateError, PcflowError,
        StageAlreadyRunningError, StageFailureError, StageNotEligibleError,
        UnsupportedFlowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::exchange::{AddressExchange, InMemoryAddressExchange};
    pub use crate::flow::{
        ComputationStageFlow, Orchestrator, PhaseSpec, RunPhaseOptions,
    };
    pub use crate::graph::{FlowTable, StageDispatcher, StageGraph, StageNode};
    pub use crate::services::Services;
    pub use crate::store::{InMemoryInstanceStore, InstanceRepository, InstanceStore};
}
