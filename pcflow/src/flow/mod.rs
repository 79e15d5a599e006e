//! Phase flow for one party.
//!
//! [`ComputationStageFlow`] is the state machine deciding which phase may
//! start; [`PhaseService`] does each phase's work; [`Orchestrator`] ties them
//! to the instance repository, handling retries and cancellation.

mod orchestrator;
mod partial_retry;
mod phase_service;
mod stage_flow;

pub use orchestrator::{Orchestrator, RunPhaseOptions};
pub use partial_retry::partial_container_retry;
pub use phase_service::{ContainerPhase, PhaseRun, PhaseService, COMPUTE_PORT};
pub use stage_flow::{ComputationStageFlow, PhaseSpec, TransitionKind};
