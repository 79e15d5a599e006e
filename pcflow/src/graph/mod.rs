//! Id-matching stage graph and dispatch.
//!
//! This module provides:
//! - Declarative flow tables keyed by role and protocol
//! - The file layout convention for stage outputs
//! - The [`StageGraph`] arena with output-path propagation
//! - Stage services that launch each stage's containers
//! - The [`StageDispatcher`] that runs the graph in waves

mod dag;
mod dispatcher;
mod flow;
pub mod paths;
mod stage;

pub use dag::{StageGraph, StageNode};
pub use dispatcher::StageDispatcher;
pub use flow::{FlowEntry, FlowTable};
pub use stage::{render_cmd_args, LaunchedStage, StageContext, StageService, PID_SERVER_PORT};
