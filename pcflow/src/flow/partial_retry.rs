//! Re-running only the containers that did not complete.

use crate::core::{ComputationInstance, ContainerStatus, GameArgs, Phase};
use tracing::{info, warn};

/// Arguments for the containers of `phase` that need to run again.
///
/// Returns `None` when a normal run should happen instead:
/// - the feature is disabled;
/// - the instance is not at the phase's failed status;
/// - the phase has no recorded run with arguments;
/// - every recorded container completed.
///
/// Containers and arguments of the last run are paired positionally. When
/// their counts differ the pairing is meaningless and every argument set is
/// returned.
#[must_use]
pub fn partial_container_retry(
    instance: &ComputationInstance,
    phase: Phase,
    enabled: bool,
) -> Option<Vec<GameArgs>> {
    if !enabled || instance.status != phase.failed_status() {
        return None;
    }

    let last = instance.last_phase_run(phase)?;
    if last.game_args.is_empty() {
        return None;
    }

    if last.containers.len() != last.game_args.len() {
        warn!(
            instance_id = %instance.instance_id,
            phase = %phase,
            containers = last.containers.len(),
            game_args = last.game_args.len(),
            "Container and argument counts differ; retrying every container"
        );
        return Some(last.game_args.clone());
    }

    let retry: Vec<GameArgs> = last
        .containers
        .iter()
        .zip(&last.game_args)
        .filter(|(container, _)| container.status != ContainerStatus::Completed)
        .map(|(_, args)| args.clone())
        .collect();

    if retry.is_empty() {
        return None;
    }

    info!(
        instance_id = %instance.instance_id,
        phase = %phase,
        retrying = retry.len(),
        of = last.game_args.len(),
        "Retrying unfinished containers only"
    );
    Some(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContainerInstance, InstanceStatus, Protocol, Role, SubInstance};
    use serde_json::json;

    fn args(name: &str) -> GameArgs {
        let mut args = GameArgs::new();
        args.insert("name".to_string(), json!(name));
        args
    }

    fn failed_prepare(statuses: &[ContainerStatus], names: &[&str]) -> ComputationInstance {
        let mut instance = ComputationInstance::new("run-1", Role::Publisher, Protocol::UnionPid);
        instance.status = InstanceStatus::PrepareFailed;

        let mut sub = SubInstance::new("run-1_prepare0", Phase::Prepare, 0);
        sub.set_containers(
            statuses
                .iter()
                .enumerate()
                .map(|(i, s)| ContainerInstance::new(format!("c{i}"), *s))
                .collect(),
        );
        sub.game_args = names.iter().map(|n| args(n)).collect();
        instance.push_sub_instance(sub);
        instance
    }

    #[test]
    fn test_only_unfinished_containers_are_retried() {
        let instance = failed_prepare(
            &[ContainerStatus::Completed, ContainerStatus::Failed, ContainerStatus::Completed],
            &["a", "b", "c"],
        );

        let retry = partial_container_retry(&instance, Phase::Prepare, true).unwrap();
        assert_eq!(retry, vec![args("b")]);
    }

    #[test]
    fn test_count_mismatch_retries_everything() {
        let instance = failed_prepare(
            &[ContainerStatus::Failed, ContainerStatus::Completed],
            &["a", "b", "c"],
        );

        let retry = partial_container_retry(&instance, Phase::Prepare, true).unwrap();
        assert_eq!(retry.len(), 3);
    }

    #[test]
    fn test_not_applicable() {
        let instance = failed_prepare(&[ContainerStatus::Failed], &["a"]);
        assert!(partial_container_retry(&instance, Phase::Prepare, false).is_none());
        assert!(partial_container_retry(&instance, Phase::Compute, true).is_none());

        let mut advanced = instance.clone();
        advanced.status = InstanceStatus::IdMatchCompleted;
        assert!(partial_container_retry(&advanced, Phase::Prepare, true).is_none());

        let all_done = failed_prepare(&[ContainerStatus::Completed], &["a"]);
        assert!(partial_container_retry(&all_done, Phase::Prepare, true).is_none());
    }
}
