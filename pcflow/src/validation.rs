//! Best-effort pre-flight checks.
//!
//! Validators look at an instance before a phase starts and report anything
//! suspicious. They never block a run: errors and panics are downgraded to
//! warnings and returned to the caller.

use crate::core::ComputationInstance;
use anyhow::{bail, ensure};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// A single pre-flight check.
pub trait PreflightValidator: Send + Sync {
    /// Name used in warnings.
    fn name(&self) -> &str;

    /// Checks the instance.
    fn validate(&self, instance: &ComputationInstance) -> anyhow::Result<()>;
}

/// Runs every validator and returns one warning per failed check.
pub fn run_preflight(
    validators: &[Box<dyn PreflightValidator>],
    instance: &ComputationInstance,
) -> Vec<String> {
    let mut warnings = Vec::new();

    for validator in validators {
        let outcome = catch_unwind(AssertUnwindSafe(|| validator.validate(instance)));
        let message = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{}: {e:#}", validator.name()),
            Err(_) => format!("{}: validator panicked", validator.name()),
        };
        warn!(
            instance_id = %instance.instance_id,
            validator = validator.name(),
            warning = %message,
            "Pre-flight check failed"
        );
        warnings.push(message);
    }

    warnings
}

/// The checks run before every phase unless the caller supplies its own.
#[must_use]
pub fn default_validators() -> Vec<Box<dyn PreflightValidator>> {
    vec![
        Box::new(InputPathValidator),
        Box::new(ShardCountValidator::default()),
    ]
}

/// Input and output locations are set and look like paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputPathValidator;

impl PreflightValidator for InputPathValidator {
    fn name(&self) -> &str {
        "input_path"
    }

    fn validate(&self, instance: &ComputationInstance) -> anyhow::Result<()> {
        ensure!(!instance.input_path.trim().is_empty(), "input path is empty");
        ensure!(!instance.output_dir.trim().is_empty(), "output directory is empty");
        if instance.input_path.chars().any(char::is_whitespace) {
            bail!("input path '{}' contains whitespace", instance.input_path);
        }
        Ok(())
    }
}

/// Shard and container counts are within range.
#[derive(Debug, Clone, Copy)]
pub struct ShardCountValidator {
    /// Largest shard count considered sane.
    pub max_shards: usize,
}

impl Default for ShardCountValidator {
    fn default() -> Self {
        Self { max_shards: 1024 }
    }
}

impl PreflightValidator for ShardCountValidator {
    fn name(&self) -> &str {
        "shard_count"
    }

    fn validate(&self, instance: &ComputationInstance) -> anyhow::Result<()> {
        ensure!(instance.num_shards > 0, "num_shards must be positive");
        ensure!(instance.num_containers > 0, "num_containers must be positive");
        ensure!(
            instance.num_shards <= self.max_shards,
            "num_shards {} exceeds {}",
            instance.num_shards,
            self.max_shards
        );
        Ok(())
    }
}
