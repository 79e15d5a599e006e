//! The persisted computation instance and its audit trail.

use super::{ContainerInstance, InstanceStatus, Phase, Protocol, Role, StageKind, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-container arguments for a phase or stage run.
pub type GameArgs = serde_json::Map<String, serde_json::Value>;

/// One recorded run of a phase, or of a single stage within the id-match graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubInstance {
    /// Deterministic id, see [`ComputationInstance::sub_instance_id`].
    pub id: String,
    /// The phase this run belongs to.
    pub phase: Phase,
    /// The graph stage, for id-match stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    /// The instance retry counter at the time of the run.
    pub retry_counter: u32,
    /// Input paths the run consumed.
    #[serde(default)]
    pub input_paths: Vec<String>,
    /// Containers launched, positionally paired with `game_args`.
    #[serde(default)]
    pub containers: Vec<ContainerInstance>,
    /// Arguments each container was launched with.
    #[serde(default)]
    pub game_args: Vec<GameArgs>,
    /// Peer addresses used by a joint run.
    #[serde(default)]
    pub server_ips: Vec<String>,
    /// When the run was recorded.
    pub created_at: DateTime<Utc>,
    /// When the container snapshots were last refreshed.
    pub updated_at: DateTime<Utc>,
}

impl SubInstance {
    /// Creates an empty record.
    #[must_use]
    pub fn new(id: impl Into<String>, phase: Phase, retry_counter: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase,
            stage: None,
            retry_counter,
            input_paths: Vec::new(),
            containers: Vec::new(),
            game_args: Vec::new(),
            server_ips: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the record as a graph stage run.
    #[must_use]
    pub fn for_stage(mut self, stage: StageKind) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Replaces the container snapshots.
    pub fn set_containers(&mut self, containers: Vec<ContainerInstance>) {
        self.containers = containers;
        self.updated_at = Utc::now();
    }

    /// Network addresses of the launched containers, in launch order.
    #[must_use]
    pub fn container_ips(&self) -> Vec<String> {
        self.containers
            .iter()
            .filter_map(|c| c.ip_address.clone())
            .collect()
    }
}

/// The aggregate root persisted per computation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationInstance {
    /// Unique id of the run.
    pub instance_id: String,
    /// Which party this process drives.
    pub role: Role,
    /// Id-matching protocol.
    pub protocol: Protocol,
    /// Raw input dataset.
    pub input_path: String,
    /// Directory all outputs are written under.
    pub output_dir: String,
    /// Number of shards the input is split into.
    pub num_shards: usize,
    /// Number of containers for non-graph phases.
    pub num_containers: usize,
    /// Top-level status.
    pub status: InstanceStatus,
    /// Most recently requested phase.
    pub current_phase: Option<Phase>,
    /// Retries of the current phase; reset when advancing.
    pub retry_counter: u32,
    /// Append-only audit trail of phase and stage runs.
    #[serde(default)]
    pub sub_instances: Vec<SubInstance>,
    /// Status of each registered id-match stage.
    #[serde(default)]
    pub stage_status: BTreeMap<StageKind, StageStatus>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted mutation.
    pub updated_at: DateTime<Utc>,
}

impl ComputationInstance {
    /// Creates a new instance in the `Created` status.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, role: Role, protocol: Protocol) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            role,
            protocol,
            input_path: String::new(),
            output_dir: String::new(),
            num_shards: 1,
            num_containers: 1,
            status: InstanceStatus::Created,
            current_phase: None,
            retry_counter: 0,
            sub_instances: Vec::new(),
            stage_status: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the raw input path.
    #[must_use]
    pub fn with_input_path(mut self, path: impl Into<String>) -> Self {
        self.input_path = path.into();
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the shard count.
    #[must_use]
    pub fn with_num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Sets the container count for non-graph phases.
    #[must_use]
    pub fn with_num_containers(mut self, num_containers: usize) -> Self {
        self.num_containers = num_containers;
        self
    }

    /// Base path all outputs of this run derive from.
    #[must_use]
    pub fn output_base(&self) -> String {
        format!("{}/{}", self.output_dir.trim_end_matches('/'), self.instance_id)
    }

    /// Deterministic id for a phase run, or a stage run within a phase.
    ///
    /// `{instance_id}_{phase}{retry_counter}`, with `_{stage}` appended for stages.
    #[must_use]
    pub fn sub_instance_id(&self, phase: Phase, stage: Option<StageKind>) -> String {
        let base = format!("{}_{}{}", self.instance_id, phase, self.retry_counter);
        match stage {
            Some(stage) => format!("{base}_{stage}"),
            None => base,
        }
    }

    /// Status of a stage; unregistered stages are `Unknown`.
    #[must_use]
    pub fn stage_status(&self, stage: StageKind) -> StageStatus {
        self.stage_status.get(&stage).copied().unwrap_or_default()
    }

    /// Records the status of a stage.
    pub fn set_stage_status(&mut self, stage: StageKind, status: StageStatus) {
        self.stage_status.insert(stage, status);
    }

    /// Registers stages, leaving already-known statuses untouched.
    pub fn register_stages(&mut self, stages: impl IntoIterator<Item = StageKind>) {
        for stage in stages {
            self.stage_status.entry(stage).or_insert(StageStatus::Ready);
        }
    }

    /// Returns true when at least one stage is registered and all are completed.
    #[must_use]
    pub fn all_stages_completed(&self) -> bool {
        !self.stage_status.is_empty()
            && self
                .stage_status
                .values()
                .all(|s| *s == StageStatus::Completed)
    }

    /// Returns true when any registered stage failed.
    #[must_use]
    pub fn any_stage_failed(&self) -> bool {
        self.stage_status.values().any(|s| *s == StageStatus::Failed)
    }

    /// Makes failed stages eligible again. Returns the stages reset.
    pub fn reset_failed_stages(&mut self) -> Vec<StageKind> {
        let mut reset = Vec::new();
        for (stage, status) in &mut self.stage_status {
            if *status == StageStatus::Failed {
                *status = StageStatus::Ready;
                reset.push(*stage);
            }
        }
        reset
    }

    /// Appends a run record.
    pub fn push_sub_instance(&mut self, sub_instance: SubInstance) {
        self.sub_instances.push(sub_instance);
    }

    /// The most recent run record.
    #[must_use]
    pub fn last_sub_instance(&self) -> Option<&SubInstance> {
        self.sub_instances.last()
    }

    /// The most recent whole-phase record for `phase` (stage runs excluded).
    #[must_use]
    pub fn last_phase_run(&self, phase: Phase) -> Option<&SubInstance> {
        self.sub_instances
            .iter()
            .rev()
            .find(|s| s.phase == phase && s.stage.is_none())
    }

    /// The most recent record for a graph stage.
    #[must_use]
    pub fn last_stage_run(&self, stage: StageKind) -> Option<&SubInstance> {
        self.sub_instances.iter().rev().find(|s| s.stage == Some(stage))
    }

    /// Mutable access to a record by id.
    pub fn sub_instance_mut(&mut self, id: &str) -> Option<&mut SubInstance> {
        self.sub_instances.iter_mut().rev().find(|s| s.id == id)
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ContainerStatus;

    fn instance() -> ComputationInstance {
        ComputationInstance::new("run-1", Role::Publisher, Protocol::UnionPid)
            .with_input_path("/in/data.csv")
            .with_output_dir("/out/")
            .with_num_shards(2)
    }

    #[test]
    fn test_new_instance_defaults() {
        let inst = instance();
        assert_eq!(inst.status, InstanceStatus::Created);
        assert_eq!(inst.retry_counter, 0);
        assert!(inst.sub_instances.is_empty());
        assert_eq!(inst.output_base(), "/out/run-1");
    }

    #[test]
    fn test_sub_instance_id_is_deterministic() {
        let mut inst = instance();
        assert_eq!(inst.sub_instance_id(Phase::Compute, None), "run-1_compute0");
        inst.retry_counter = 2;
        assert_eq!(
            inst.sub_instance_id(Phase::IdMatch, Some(StageKind::Shard)),
            "run-1_id_match2_shard"
        );
    }

    #[test]
    fn test_register_stages_keeps_existing_status() {
        let mut inst = instance();
        inst.set_stage_status(StageKind::Shard, StageStatus::Completed);
        inst.register_stages(StageKind::ALL);

        assert_eq!(inst.stage_status(StageKind::Shard), StageStatus::Completed);
        assert_eq!(inst.stage_status(StageKind::Prepare), StageStatus::Ready);
        assert!(!inst.all_stages_completed());
    }

    #[test]
    fn test_stage_rollups() {
        let mut inst = instance();
        assert!(!inst.all_stages_completed());

        inst.set_stage_status(StageKind::Shard, StageStatus::Completed);
        assert!(inst.all_stages_completed());

        inst.set_stage_status(StageKind::Prepare, StageStatus::Failed);
        assert!(inst.any_stage_failed());
        assert!(!inst.all_stages_completed());
    }

    #[test]
    fn test_reset_failed_stages() {
        let mut inst = instance();
        inst.set_stage_status(StageKind::Shard, StageStatus::Completed);
        inst.set_stage_status(StageKind::Prepare, StageStatus::Failed);

        assert_eq!(inst.reset_failed_stages(), vec![StageKind::Prepare]);
        assert_eq!(inst.stage_status(StageKind::Prepare), StageStatus::Ready);
        assert_eq!(inst.stage_status(StageKind::Shard), StageStatus::Completed);
        assert!(!inst.any_stage_failed());
    }

    #[test]
    fn test_last_runs() {
        let mut inst = instance();
        inst.push_sub_instance(SubInstance::new("a", Phase::IdMatch, 0).for_stage(StageKind::Shard));
        inst.push_sub_instance(SubInstance::new("b", Phase::Compute, 0));
        inst.push_sub_instance(SubInstance::new("c", Phase::Compute, 1));

        assert_eq!(inst.last_sub_instance().map(|s| s.id.as_str()), Some("c"));
        assert_eq!(inst.last_phase_run(Phase::Compute).map(|s| s.id.as_str()), Some("c"));
        assert!(inst.last_phase_run(Phase::IdMatch).is_none());
        assert_eq!(
            inst.last_stage_run(StageKind::Shard).map(|s| s.id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn test_container_ips() {
        let mut sub = SubInstance::new("x", Phase::Compute, 0);
        sub.set_containers(vec![
            ContainerInstance::new("c1", ContainerStatus::Started).with_ip("10.0.0.1"),
            ContainerInstance::new("c2", ContainerStatus::Started),
        ]);
        assert_eq!(sub.container_ips(), vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_instance_serde_round_trip() {
        let mut inst = instance();
        inst.set_stage_status(StageKind::RunPid, StageStatus::Started);
        let json = serde_json::to_string(&inst).unwrap();
        let back: ComputationInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
