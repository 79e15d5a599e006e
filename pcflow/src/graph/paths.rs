//! File layout convention shared by every stage and phase.
//!
//! - sharded artifacts: `{base}_{shard_index}`
//! - stage outputs: `{base}{stage_suffix}`
//! - metrics sidecars: `{shard_output_path}_metrics`

use crate::core::{Phase, Role, StageKind};

/// Suffix appended to the base output path for a stage's output.
#[must_use]
pub fn stage_suffix(stage: StageKind, role: Role) -> String {
    let role = role.file_token();
    match stage {
        StageKind::Shard => format!("_{role}_sharded"),
        StageKind::Prepare => format!("_{role}_prepared"),
        StageKind::RunPid => format!("_{role}_pid_matched"),
    }
}

/// Suffix appended to the base output path for a container phase's output.
///
/// Id matching writes through its stages, so its output is the `RunPid`
/// stage output.
#[must_use]
pub fn phase_suffix(phase: Phase, role: Role) -> String {
    let token = role.file_token();
    match phase {
        Phase::IdMatch => stage_suffix(StageKind::RunPid, role),
        Phase::Prepare => format!("_{token}_combined"),
        Phase::Compute => format!("_{token}_computed"),
        Phase::Aggregate => format!("_{token}_aggregated"),
        Phase::PostProcess => format!("_{token}_post_processed"),
    }
}

/// `{base}{stage_suffix}`
#[must_use]
pub fn stage_output_path(base: &str, stage: StageKind, role: Role) -> String {
    format!("{base}{}", stage_suffix(stage, role))
}

/// `{base}{phase_suffix}`
#[must_use]
pub fn phase_output_path(base: &str, phase: Phase, role: Role) -> String {
    format!("{base}{}", phase_suffix(phase, role))
}

/// `{base}_{shard_index}`
#[must_use]
pub fn sharded_path(base: &str, shard_index: usize) -> String {
    format!("{base}_{shard_index}")
}

/// `{shard_output_path}_metrics`
#[must_use]
pub fn metrics_path(shard_output_path: &str) -> String {
    format!("{shard_output_path}_metrics")
}
