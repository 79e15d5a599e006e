//! The per-party phase state machine.

use crate::config::PhaseTimeouts;
use crate::core::{ComputationInstance, InstanceStatus, Phase};
use crate::errors::InvalidStateError;
use std::time::Duration;
use tracing::debug;

/// Static description of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    /// The phase.
    pub phase: Phase,
    /// The phase that must complete first, if any.
    pub previous_phase: Option<Phase>,
    /// Status the instance holds when the phase may start normally.
    pub start_status: InstanceStatus,
    /// Status while in flight.
    pub started_status: InstanceStatus,
    /// Status on success.
    pub completed_status: InstanceStatus,
    /// Status on failure.
    pub failed_status: InstanceStatus,
    /// Whether the parties' containers talk to each other.
    pub is_joint_stage: bool,
    /// Container timeout unless the caller overrides it.
    pub default_timeout: Duration,
}

/// How a validated transition was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The previous phase completed; the retry counter was reset.
    Advance,
    /// The phase itself failed last time; the retry counter was incremented.
    Retry,
    /// Neither, but the caller asked for a dry run.
    Override,
}

/// Ordered phases with their statuses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComputationStageFlow {
    timeouts: PhaseTimeouts,
}

impl ComputationStageFlow {
    /// id-match → prepare → compute → aggregate → post-process.
    #[must_use]
    pub fn standard(timeouts: &PhaseTimeouts) -> Self {
        Self {
            timeouts: timeouts.clone(),
        }
    }

    /// All phases in order.
    #[must_use]
    pub fn phases(&self) -> Vec<PhaseSpec> {
        Phase::ALL.into_iter().map(|phase| self.spec(phase)).collect()
    }

    /// The phase before `phase`.
    #[must_use]
    pub fn previous(&self, phase: Phase) -> Option<Phase> {
        let idx = Phase::ALL.iter().position(|p| *p == phase)?;
        idx.checked_sub(1).map(|prev| Phase::ALL[prev])
    }

    /// Statuses, predecessor and timeout of a phase.
    #[must_use]
    pub fn spec(&self, phase: Phase) -> PhaseSpec {
        let previous_phase = self.previous(phase);
        PhaseSpec {
            phase,
            previous_phase,
            start_status: previous_phase.map_or(InstanceStatus::Created, |p| p.completed_status()),
            started_status: phase.started_status(),
            completed_status: phase.completed_status(),
            failed_status: phase.failed_status(),
            is_joint_stage: phase == Phase::Compute,
            default_timeout: self.timeouts.for_phase(phase),
        }
    }

    /// The phase after `phase`.
    #[must_use]
    pub fn next(&self, phase: Phase) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|candidate| self.previous(*candidate) == Some(phase))
    }

    /// Checks that `target` may start now and updates the retry counter.
    ///
    /// - any started status is rejected, even on a dry run;
    /// - from `start_status` the counter resets to zero;
    /// - from the phase's own failed status the counter increments;
    /// - anything else is allowed only on a dry run.
    pub fn validate_transition(
        &self,
        instance: &mut ComputationInstance,
        target: Phase,
        dry_run: bool,
    ) -> Result<TransitionKind, InvalidStateError> {
        let spec = self.spec(target);
        let current = instance.status;

        let kind = if current.is_started() {
            return Err(InvalidStateError {
                current,
                target,
                reason: "another phase is still running".to_string(),
            });
        } else if current == spec.start_status {
            instance.retry_counter = 0;
            TransitionKind::Advance
        } else if current == spec.failed_status {
            instance.retry_counter += 1;
            TransitionKind::Retry
        } else if dry_run {
            TransitionKind::Override
        } else {
            return Err(InvalidStateError {
                current,
                target,
                reason: format!("expected status '{}' or '{}'", spec.start_status, spec.failed_status),
            });
        };

        debug!(
            instance_id = %instance.instance_id,
            phase = %target,
            from = %current,
            ?kind,
            retry_counter = instance.retry_counter,
            "Transition admitted"
        );
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Protocol, Role};

    fn instance_at(status: InstanceStatus) -> ComputationInstance {
        let mut instance = ComputationInstance::new("run-1", Role::Publisher, Protocol::UnionPid);
        instance.status = status;
        instance
    }

    #[test]
    fn test_standard_flow_chains_phases() {
        let flow = ComputationStageFlow::default();
        assert_eq!(flow.phases().len(), 5);

        let first = flow.spec(Phase::IdMatch);
        assert_eq!(first.previous_phase, None);
        assert_eq!(first.start_status, InstanceStatus::Created);

        let compute = flow.spec(Phase::Compute);
        assert_eq!(compute.previous_phase, Some(Phase::Prepare));
        assert_eq!(compute.start_status, InstanceStatus::PrepareCompleted);
        assert!(compute.is_joint_stage);
        assert!(!flow.spec(Phase::Aggregate).is_joint_stage);

        assert_eq!(flow.next(Phase::Prepare), Some(Phase::Compute));
        assert_eq!(flow.next(Phase::PostProcess), None);
        assert_eq!(flow.previous(Phase::IdMatch), None);
    }

    #[test]
    fn test_advance_resets_retry_counter() {
        let flow = ComputationStageFlow::default();
        let mut instance = instance_at(InstanceStatus::IdMatchCompleted);
        instance.retry_counter = 3;

        let kind = flow.validate_transition(&mut instance, Phase::Prepare, false).unwrap();
        assert_eq!(kind, TransitionKind::Advance);
        assert_eq!(instance.retry_counter, 0);
    }

    #[test]
    fn test_retry_increments_by_exactly_one() {
        let flow = ComputationStageFlow::default();
        let mut instance = instance_at(InstanceStatus::PrepareFailed);
        instance.retry_counter = 1;

        let kind = flow.validate_transition(&mut instance, Phase::Prepare, false).unwrap();
        assert_eq!(kind, TransitionKind::Retry);
        assert_eq!(instance.retry_counter, 2);
    }

    #[test]
    fn test_started_status_always_rejected() {
        let flow = ComputationStageFlow::default();
        for phase in Phase::ALL {
            for dry_run in [false, true] {
                let mut instance = instance_at(phase.started_status());
                let err = flow.validate_transition(&mut instance, Phase::Compute, dry_run).unwrap_err();
                assert_eq!(err.current, phase.started_status());
                assert_eq!(instance.retry_counter, 0);
            }
        }
    }

    #[test]
    fn test_out_of_order_requires_dry_run() {
        let flow = ComputationStageFlow::default();
        let mut instance = instance_at(InstanceStatus::Created);

        assert!(flow.validate_transition(&mut instance, Phase::Aggregate, false).is_err());
        assert_eq!(
            flow.validate_transition(&mut instance, Phase::Aggregate, true).unwrap(),
            TransitionKind::Override
        );
        assert_eq!(instance.retry_counter, 0);
    }

    #[test]
    fn test_custom_timeouts() {
        let flow = ComputationStageFlow::standard(&PhaseTimeouts::uniform(60));
        assert_eq!(flow.spec(Phase::IdMatch).default_timeout, Duration::from_secs(60));
    }
}
