//! Core domain model types for pcflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Party roles and protocols
//! - Stage, container and instance status enums
//! - The persisted computation instance and its sub-instance audit trail

mod container;
mod instance;
mod phase;
mod role;
mod status;

pub use container::ContainerInstance;
pub use instance::{ComputationInstance, GameArgs, SubInstance};
pub use phase::{InstanceStatus, Phase};
pub use role::{Protocol, Role};
pub use status::{ContainerStatus, StageKind, StageStatus};
