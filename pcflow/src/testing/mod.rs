//! Testing utilities for pcflow.
//!
//! This module provides:
//! - A scripted in-memory container backend
//! - Instance, configuration and service fixtures

mod backend;
pub mod fixtures;

pub use backend::ScriptedContainerBackend;
