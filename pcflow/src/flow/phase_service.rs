//! Per-phase container logic.

use crate::config::binaries;
use crate::container::aggregate_status;
use crate::core::{
    ComputationInstance, ContainerInstance, GameArgs, InstanceStatus, Phase, Protocol, Role,
    StageKind, StageStatus, SubInstance,
};
use crate::errors::{MissingServerIpsError, PcflowError};
use crate::events::{EventKind, LifecycleEvent};
use crate::exchange;
use crate::graph::{paths, render_cmd_args, StageDispatcher, StageGraph};
use crate::services::Services;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port the publisher's compute containers listen on.
pub const COMPUTE_PORT: u16 = 15300;

/// Inputs of a single phase run.
#[derive(Debug, Clone, Default)]
pub struct PhaseRun {
    /// Publisher addresses, for the partner side of joint work.
    pub server_ips: Vec<String>,
    /// Wait for containers to reach a terminal status before returning.
    pub wait_for_containers: bool,
    /// Container timeout.
    pub timeout: Duration,
    /// Arguments for a partial retry; `None` launches the full fleet.
    pub retry_game_args: Option<Vec<GameArgs>>,
}

/// A phase whose work is one fleet of identical binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPhase {
    /// The phase.
    pub phase: Phase,
    /// The phase whose output this one reads.
    pub input_phase: Phase,
    /// Binary launched in every container.
    pub binary: &'static str,
    /// Whether the parties' containers connect to each other.
    pub joint: bool,
    /// One container per `num_containers` rather than a single one.
    pub fan_out: bool,
}

/// The work behind a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseService {
    /// Drives the id-match stage graph.
    IdMatch,
    /// Launches one container fleet.
    Containers(ContainerPhase),
}

impl PhaseService {
    /// The service for `phase`.
    ///
    /// Role and protocol are consumed by the stage graph and by the
    /// per-container arguments, so every combination maps to the same
    /// service kind.
    #[must_use]
    pub fn for_phase(phase: Phase, _role: Role, _protocol: Protocol) -> Self {
        match phase {
            Phase::IdMatch => Self::IdMatch,
            Phase::Prepare => Self::Containers(ContainerPhase {
                phase,
                input_phase: Phase::IdMatch,
                binary: binaries::ID_COMBINER,
                joint: false,
                fan_out: true,
            }),
            Phase::Compute => Self::Containers(ContainerPhase {
                phase,
                input_phase: Phase::Prepare,
                binary: binaries::COMPUTE,
                joint: true,
                fan_out: true,
            }),
            Phase::Aggregate => Self::Containers(ContainerPhase {
                phase,
                input_phase: Phase::Compute,
                binary: binaries::AGGREGATOR,
                joint: false,
                fan_out: false,
            }),
            Phase::PostProcess => Self::Containers(ContainerPhase {
                phase,
                input_phase: Phase::Aggregate,
                binary: binaries::POST_PROCESSOR,
                joint: false,
                fan_out: false,
            }),
        }
    }

    /// The phase this service runs.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::IdMatch => Phase::IdMatch,
            Self::Containers(cp) => cp.phase,
        }
    }

    /// Launches the phase's work for `instance`.
    ///
    /// `instance` must already carry the retry counter of this run.
    pub async fn run(
        &self,
        services: &Services,
        instance: &ComputationInstance,
        run: &PhaseRun,
    ) -> Result<(), PcflowError> {
        match self {
            Self::IdMatch => run_id_match(services, instance, run).await,
            Self::Containers(cp) => cp.run(services, instance, run).await,
        }
    }

    /// Re-reads container state, persists it and returns the derived status.
    pub async fn get_status(
        &self,
        services: &Services,
        instance_id: &str,
    ) -> Result<InstanceStatus, PcflowError> {
        match self {
            Self::IdMatch => id_match_status(services, instance_id).await,
            Self::Containers(cp) => cp.status(services, instance_id).await,
        }
    }
}

async fn run_id_match(
    services: &Services,
    instance: &ComputationInstance,
    run: &PhaseRun,
) -> Result<(), PcflowError> {
    let mut graph = StageGraph::build(
        &services.flows,
        instance.role,
        instance.protocol,
        &instance.input_path,
        &instance.output_base(),
        &instance.stage_status,
    )?;

    let detach = services.config.detach_final_stage || !run.wait_for_containers;
    StageDispatcher::new(services.clone(), &instance.instance_id)
        .with_server_ips(run.server_ips.clone())
        .with_timeout(run.timeout)
        .with_detach_final_stage(detach)
        .run_all(&mut graph)
        .await
}

async fn id_match_status(services: &Services, instance_id: &str) -> Result<InstanceStatus, PcflowError> {
    let instance = services.repository.read(instance_id).await?;

    let mut refreshed: Vec<(StageKind, String, Vec<ContainerInstance>)> = Vec::new();
    for (stage, status) in &instance.stage_status {
        if *status != StageStatus::Started {
            continue;
        }
        if let Some(sub) = instance.last_stage_run(*stage) {
            let containers = services.supervisor.refresh(&sub.containers).await?;
            refreshed.push((*stage, sub.id.clone(), containers));
        }
    }

    let phase = Phase::IdMatch;
    let updated = services
        .repository
        .update(instance_id, |i| {
            for (stage, sub_id, containers) in refreshed {
                let status = aggregate_status(&containers);
                if let Some(sub) = i.sub_instance_mut(&sub_id) {
                    sub.set_containers(containers);
                }
                if status.is_terminal() {
                    i.set_stage_status(stage, status);
                }
            }

            if i.any_stage_failed() {
                i.status = phase.failed_status();
            } else if i.all_stages_completed() {
                i.status = phase.completed_status();
            } else if i.stage_status.values().any(|s| *s == StageStatus::Started) {
                i.status = phase.started_status();
            }
        })
        .await?;

    debug!(instance_id = %instance_id, status = %updated.status, "Derived id-match status");
    Ok(updated.status)
}

impl ContainerPhase {
    fn fan_out_count(instance: &ComputationInstance) -> usize {
        instance.num_containers.clamp(1, instance.num_shards.max(1))
    }

    /// Per-container arguments of a full run.
    ///
    /// Fan-out phases split the shards into contiguous ranges, one per
    /// container; the partner's joint containers each get a publisher
    /// address, round-robin.
    pub fn game_args(
        &self,
        instance: &ComputationInstance,
        server_ips: &[String],
    ) -> Result<Vec<GameArgs>, PcflowError> {
        if self.joint && instance.role == Role::Partner && server_ips.is_empty() {
            return Err(MissingServerIpsError { phase: self.phase }.into());
        }

        let base = instance.output_base();
        let input_base = paths::phase_output_path(&base, self.input_phase, instance.role);
        let output_base = paths::phase_output_path(&base, self.phase, instance.role);

        if !self.fan_out {
            let mut args = GameArgs::new();
            args.insert("input_base_path".to_string(), json!(input_base));
            args.insert("output_path".to_string(), json!(output_base));
            args.insert("num_files".to_string(), json!(instance.num_shards));
            return Ok(vec![args]);
        }

        let ranges = shard_ranges(instance.num_shards, Self::fan_out_count(instance));
        Ok(ranges
            .into_iter()
            .enumerate()
            .map(|(i, (start, count))| {
                let mut args = GameArgs::new();
                args.insert("input_base_path".to_string(), json!(input_base));
                args.insert("output_base_path".to_string(), json!(output_base));
                args.insert("file_start_index".to_string(), json!(start));
                args.insert("num_files".to_string(), json!(count));
                if self.phase == Phase::Prepare {
                    args.insert("data_path".to_string(), json!(instance.input_path));
                }
                if self.joint {
                    match instance.role {
                        Role::Publisher => {
                            args.insert("port".to_string(), json!(COMPUTE_PORT));
                        }
                        Role::Partner => {
                            let server = &server_ips[i % server_ips.len()];
                            args.insert("server_ip".to_string(), json!(format!("{server}:{COMPUTE_PORT}")));
                        }
                    }
                }
                args
            })
            .collect())
    }

    async fn run(
        &self,
        services: &Services,
        instance: &ComputationInstance,
        run: &PhaseRun,
    ) -> Result<(), PcflowError> {
        let game_args = match &run.retry_game_args {
            Some(args) => args.clone(),
            None => self.game_args(instance, &run.server_ips)?,
        };
        let cmd_args = game_args.iter().map(render_cmd_args).collect();

        let containers = services
            .supervisor
            .start(self.binary, cmd_args, run.timeout, services.config.container_env.clone())
            .await?;

        let sub_id = instance.sub_instance_id(self.phase, None);
        let mut sub = SubInstance::new(&sub_id, self.phase, instance.retry_counter);
        sub.input_paths = vec![paths::phase_output_path(
            &instance.output_base(),
            self.input_phase,
            instance.role,
        )];
        sub.game_args = game_args;
        sub.server_ips = run.server_ips.clone();
        sub.set_containers(containers.clone());
        services
            .repository
            .update(&instance.instance_id, |i| i.push_sub_instance(sub))
            .await?;
        info!(
            instance_id = %instance.instance_id,
            phase = %self.phase,
            binary = self.binary,
            containers = containers.len(),
            "Phase containers started"
        );

        if self.joint && instance.role == Role::Publisher {
            publish_addresses(services, &instance.instance_id, self.phase, &containers).await?;
        }

        if !run.wait_for_containers {
            return Ok(());
        }

        let containers = services
            .supervisor
            .wait_until_terminal_with_timeout(containers, services.config.poll_interval(), run.timeout)
            .await?;
        services
            .repository
            .update(&instance.instance_id, |i| {
                if let Some(sub) = i.sub_instance_mut(&sub_id) {
                    sub.set_containers(containers);
                }
            })
            .await?;
        Ok(())
    }

    async fn status(&self, services: &Services, instance_id: &str) -> Result<InstanceStatus, PcflowError> {
        let instance = services.repository.read(instance_id).await?;
        let Some(last) = instance.last_phase_run(self.phase) else {
            warn!(instance_id = %instance_id, phase = %self.phase, "No recorded run; status unchanged");
            return Ok(instance.status);
        };

        let sub_id = last.id.clone();
        let containers = services.supervisor.refresh(&last.containers).await?;
        let status = match aggregate_status(&containers) {
            StageStatus::Completed => self.phase.completed_status(),
            StageStatus::Failed => self.phase.failed_status(),
            StageStatus::Started | StageStatus::Ready | StageStatus::Unknown => self.phase.started_status(),
        };

        services
            .repository
            .update(instance_id, |i| {
                if let Some(sub) = i.sub_instance_mut(&sub_id) {
                    sub.set_containers(containers);
                }
                i.status = status;
            })
            .await?;
        Ok(status)
    }
}

async fn publish_addresses(
    services: &Services,
    instance_id: &str,
    phase: Phase,
    containers: &[ContainerInstance],
) -> Result<(), PcflowError> {
    let addresses: Vec<String> = containers.iter().filter_map(|c| c.ip_address.clone()).collect();
    if addresses.is_empty() {
        warn!(instance_id = %instance_id, phase = %phase, "Containers have no addresses yet; nothing published");
        return Ok(());
    }

    let key = exchange::phase_key(instance_id, phase);
    services.exchange.put(&key, &addresses).await?;
    services.events.try_emit(
        LifecycleEvent::new(EventKind::AddressesPublished, instance_id)
            .with_phase(phase)
            .with_detail(json!({ "key": key, "addresses": addresses })),
    );
    info!(instance_id = %instance_id, key = %key, count = addresses.len(), "Published container addresses");
    Ok(())
}

/// Splits `num_shards` into `parts` contiguous `(start, count)` ranges whose
/// sizes differ by at most one.
fn shard_ranges(num_shards: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.max(1);
    let (size, extra) = (num_shards / parts, num_shards % parts);
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let count = size + usize::from(i < extra);
            let range = (start, count);
            start += count;
            range
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerBackend;
    use crate::core::ContainerStatus;
    use crate::testing::{fixtures, ScriptedContainerBackend};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn arg_str<'a>(args: &'a GameArgs, key: &str) -> Option<&'a str> {
        args.get(key).and_then(serde_json::Value::as_str)
    }

    fn container_phase(phase: Phase) -> ContainerPhase {
        match PhaseService::for_phase(phase, Role::Publisher, Protocol::UnionPid) {
            PhaseService::Containers(cp) => cp,
            PhaseService::IdMatch => panic!("{phase} is not a container phase"),
        }
    }

    #[test]
    fn test_factory_covers_every_phase() {
        for phase in Phase::ALL {
            let service = PhaseService::for_phase(phase, Role::Partner, Protocol::UnionPid);
            assert_eq!(service.phase(), phase);
        }
        assert_eq!(
            PhaseService::for_phase(Phase::IdMatch, Role::Publisher, Protocol::UnionPidMultikey),
            PhaseService::IdMatch
        );
        assert!(container_phase(Phase::Compute).joint);
        assert!(!container_phase(Phase::Aggregate).fan_out);
    }

    #[test]
    fn test_shard_ranges_cover_all_shards() {
        assert_eq!(shard_ranges(5, 2), vec![(0, 3), (3, 2)]);
        assert_eq!(shard_ranges(4, 4), vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        assert_eq!(shard_ranges(3, 0), vec![(0, 3)]);
    }

    #[test]
    fn test_prepare_args_read_id_match_output() {
        let instance = fixtures::publisher_instance("run-1");
        let args = container_phase(Phase::Prepare).game_args(&instance, &[]).unwrap();

        assert_eq!(args.len(), 2);
        assert_eq!(arg_str(&args[0], "input_base_path"), Some("/data/out/run-1_publisher_pid_matched"));
        assert_eq!(arg_str(&args[1], "output_base_path"), Some("/data/out/run-1_publisher_combined"));
        assert_eq!(args[1]["file_start_index"], json!(1));
        assert_eq!(arg_str(&args[0], "data_path"), Some(instance.input_path.as_str()));
    }

    #[test]
    fn test_partner_compute_needs_and_uses_server_ips() {
        let instance = fixtures::partner_instance("run-2");
        let compute = container_phase(Phase::Compute);

        let err = compute.game_args(&instance, &[]).unwrap_err();
        assert!(matches!(err, PcflowError::MissingServerIps(_)));

        let args = compute.game_args(&instance, &["10.1.0.7".to_string()]).unwrap();
        assert!(args.iter().all(|a| arg_str(a, "server_ip") == Some("10.1.0.7:15300")));
    }

    #[tokio::test]
    async fn test_publisher_compute_publishes_addresses() {
        let backend = Arc::new(ScriptedContainerBackend::new());
        let (services, events) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
        let instance = fixtures::publisher_instance("run-1");
        services.repository.create(&instance).await.unwrap();

        let service = PhaseService::for_phase(Phase::Compute, Role::Publisher, Protocol::UnionPid);
        let run = PhaseRun {
            wait_for_containers: true,
            timeout: Duration::from_secs(5),
            ..PhaseRun::default()
        };
        service.run(&services, &instance, &run).await.unwrap();

        let published = services
            .exchange
            .wait("run-1/compute", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(published, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert_eq!(events.of_kind(EventKind::AddressesPublished).len(), 1);

        let status = service.get_status(&services, "run-1").await.unwrap();
        assert_eq!(status, InstanceStatus::ComputeCompleted);
    }

    #[tokio::test]
    async fn test_status_follows_refreshed_containers() {
        let backend = Arc::new(
            ScriptedContainerBackend::new()
                .with_default_script(vec![ContainerStatus::Started, ContainerStatus::Failed]),
        );
        let (services, _) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
        let instance = fixtures::publisher_instance("run-1");
        services.repository.create(&instance).await.unwrap();

        let service = PhaseService::for_phase(Phase::Aggregate, Role::Publisher, Protocol::UnionPid);
        let run = PhaseRun {
            timeout: Duration::from_secs(5),
            ..PhaseRun::default()
        };
        service.run(&services, &instance, &run).await.unwrap();

        assert_eq!(
            service.get_status(&services, "run-1").await.unwrap(),
            InstanceStatus::AggregateStarted
        );
        assert_eq!(
            service.get_status(&services, "run-1").await.unwrap(),
            InstanceStatus::AggregateFailed
        );
        let stored = services.repository.read("run-1").await.unwrap();
        assert_eq!(
            stored.last_phase_run(Phase::Aggregate).unwrap().containers[0].status,
            ContainerStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retry_args_replace_the_full_fleet() {
        let backend = Arc::new(ScriptedContainerBackend::new());
        let (services, _) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
        let instance = fixtures::publisher_instance("run-1");
        services.repository.create(&instance).await.unwrap();

        let mut only = GameArgs::new();
        only.insert("file_start_index".to_string(), json!(1));
        let run = PhaseRun {
            wait_for_containers: true,
            timeout: Duration::from_secs(5),
            retry_game_args: Some(vec![only]),
            ..PhaseRun::default()
        };
        PhaseService::for_phase(Phase::Prepare, Role::Publisher, Protocol::UnionPid)
            .run(&services, &instance, &run)
            .await
            .unwrap();

        let starts = backend.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].cmd_args, vec!["--file_start_index=1".to_string()]);
    }
}
