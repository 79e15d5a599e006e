//! Wave-based execution of a [`StageGraph`].
//!
//! A wave is every active stage with no active predecessor that is not
//! already running. Stages within a wave run concurrently and are joined
//! before the next wave is computed, so no stage starts before all of its
//! direct predecessors completed.

use super::dag::{StageGraph, StageNode};
use super::stage::{StageContext, StageService};
use crate::container::aggregate_status;
use crate::core::{ComputationInstance, ContainerStatus, Phase, StageKind, StageStatus, SubInstance};
use crate::errors::{PcflowError, StageAlreadyRunningError, StageFailureError, StageNotEligibleError};
use crate::events::{EventKind, LifecycleEvent};
use crate::services::Services;
use futures::future::join_all;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runs the stages of one instance's graph.
#[derive(Debug, Clone)]
pub struct StageDispatcher {
    services: Services,
    instance_id: String,
    phase: Phase,
    server_ips: Vec<String>,
    timeout: Duration,
    detach_final_stage: bool,
}

impl StageDispatcher {
    /// Dispatcher for the id-match phase with timeouts from configuration.
    #[must_use]
    pub fn new(services: Services, instance_id: impl Into<String>) -> Self {
        let timeout = services.config.phase_timeouts.for_phase(Phase::IdMatch);
        let detach_final_stage = services.config.detach_final_stage;
        Self {
            services,
            instance_id: instance_id.into(),
            phase: Phase::IdMatch,
            server_ips: Vec::new(),
            timeout,
            detach_final_stage,
        }
    }

    /// Publisher addresses handed to joint stages.
    #[must_use]
    pub fn with_server_ips(mut self, server_ips: Vec<String>) -> Self {
        self.server_ips = server_ips;
        self
    }

    /// Per-stage container timeout used by waves.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the last remaining stage is launched without waiting.
    #[must_use]
    pub fn with_detach_final_stage(mut self, detach: bool) -> Self {
        self.detach_final_stage = detach;
        self
    }

    /// The instance this dispatcher drives.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Prunes stages the instance already completed, then returns the stages
    /// that may start now.
    pub fn find_eligible_stages(
        &self,
        graph: &mut StageGraph,
        instance: &ComputationInstance,
    ) -> Vec<StageNode> {
        let pruned =
            graph.prune_completed(|stage| instance.stage_status(stage) == StageStatus::Completed);
        if !pruned.is_empty() {
            debug!(instance_id = %self.instance_id, ?pruned, "Pruned completed stages");
        }

        graph
            .ready_nodes()
            .into_iter()
            .filter(|node| instance.stage_status(node.stage_kind) != StageStatus::Started)
            .cloned()
            .collect()
    }

    /// Runs one stage.
    ///
    /// Both eligibility checks happen before anything is persisted. Returns
    /// `Started` when not waiting; otherwise the aggregated container status.
    pub async fn run_stage(
        &self,
        graph: &mut StageGraph,
        stage: StageKind,
        wait_for_containers: bool,
        timeout: Duration,
    ) -> Result<StageStatus, PcflowError> {
        let instance = self.services.repository.read(&self.instance_id).await?;
        if instance.stage_status(stage) == StageStatus::Started {
            return Err(StageAlreadyRunningError { stage }.into());
        }

        let node = self
            .find_eligible_stages(graph, &instance)
            .into_iter()
            .find(|node| node.stage_kind == stage)
            .ok_or(StageNotEligibleError { stage })?;

        let registered = graph.stage_kinds();
        let status = self
            .execute(node, &instance, &registered, wait_for_containers, timeout)
            .await?;
        if status == StageStatus::Completed {
            graph.complete(stage);
        }
        Ok(status)
    }

    /// Runs one wave. Returns `false` when nothing was eligible.
    pub async fn run_next(&self, graph: &mut StageGraph) -> Result<bool, PcflowError> {
        let instance = self.services.repository.read(&self.instance_id).await?;
        let eligible = self.find_eligible_stages(graph, &instance);
        if eligible.is_empty() {
            return Ok(false);
        }

        let wait = !(self.detach_final_stage && graph.len() == 1);
        if !wait {
            info!(
                instance_id = %self.instance_id,
                stage = %eligible[0].stage_kind,
                "Launching final stage without waiting on its containers"
            );
        }

        let registered = graph.stage_kinds();
        let stages: Vec<StageKind> = eligible.iter().map(|n| n.stage_kind).collect();
        debug!(instance_id = %self.instance_id, wave = ?stages, "Running wave");

        let results = join_all(
            eligible
                .into_iter()
                .map(|node| self.execute(node, &instance, &registered, wait, self.timeout)),
        )
        .await;

        let mut first_error = None;
        for (stage, result) in stages.into_iter().zip(results) {
            match result {
                Ok(StageStatus::Completed) => {
                    graph.complete(stage);
                }
                Ok(_) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Runs waves until none is eligible.
    ///
    /// Stages left failed by an earlier attempt are reset to ready first.
    pub async fn run_all(&self, graph: &mut StageGraph) -> Result<(), PcflowError> {
        let mut reset = Vec::new();
        self.services
            .repository
            .update(&self.instance_id, |i| reset = i.reset_failed_stages())
            .await?;
        if !reset.is_empty() {
            debug!(instance_id = %self.instance_id, ?reset, "Reset failed stages for retry");
        }

        let mut waves = 0usize;
        while self.run_next(graph).await? {
            waves += 1;
        }
        info!(
            instance_id = %self.instance_id,
            waves,
            remaining = graph.len(),
            "Stage graph drained"
        );
        Ok(())
    }

    async fn execute(
        &self,
        node: StageNode,
        instance: &ComputationInstance,
        registered: &[StageKind],
        wait_for_containers: bool,
        timeout: Duration,
    ) -> Result<StageStatus, PcflowError> {
        let stage = node.stage_kind;
        let service = StageService::for_stage(stage, instance.role, instance.protocol);
        let ctx = StageContext {
            instance_id: self.instance_id.clone(),
            role: instance.role,
            protocol: instance.protocol,
            stage,
            input_paths: node.input_paths.clone(),
            output_paths: node.declared_output_paths.clone(),
            num_shards: instance.num_shards,
            server_ips: self.server_ips.clone(),
            timeout,
            env: self.services.config.container_env.clone(),
        };
        service.preflight(&ctx)?;

        let phase = self.phase;
        let (instance, ()) = self
            .services
            .repository
            .try_update(&self.instance_id, |i| {
                if i.stage_status(stage) == StageStatus::Started {
                    return Err(StageAlreadyRunningError { stage }.into());
                }
                i.register_stages(registered.iter().copied());
                i.set_stage_status(stage, StageStatus::Started);
                // A sibling in this wave may already have failed the phase.
                if !i.any_stage_failed() {
                    i.status = phase.started_status();
                }
                Ok::<_, PcflowError>(())
            })
            .await?;
        self.emit(EventKind::StageStarted, stage, json!({ "input_paths": ctx.input_paths }));
        info!(instance_id = %self.instance_id, stage = %stage, binary = service.binary_name(), "Stage started");

        let launched = match service
            .launch(&ctx, &self.services.supervisor, self.services.exchange.as_ref())
            .await
        {
            Ok(launched) => launched,
            Err(e) => {
                self.mark_failed(stage, Vec::new(), &e).await?;
                return Err(e);
            }
        };

        let sub_id = instance.sub_instance_id(phase, Some(stage));
        let mut sub = SubInstance::new(&sub_id, phase, instance.retry_counter).for_stage(stage);
        sub.input_paths = node.input_paths;
        sub.game_args = launched.game_args;
        sub.server_ips = self.server_ips.clone();
        sub.set_containers(launched.containers.clone());
        self.services
            .repository
            .update(&self.instance_id, |i| i.push_sub_instance(sub))
            .await?;

        if !wait_for_containers {
            return Ok(StageStatus::Started);
        }

        let containers = match self
            .services
            .supervisor
            .wait_until_terminal_with_timeout(
                launched.containers,
                self.services.config.poll_interval(),
                timeout,
            )
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                let e = PcflowError::from(e);
                self.mark_failed(stage, Vec::new(), &e).await?;
                return Err(e);
            }
        };

        let status = aggregate_status(&containers);
        let failed_containers: Vec<String> = containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Failed)
            .map(|c| c.id.clone())
            .collect();

        self.services
            .repository
            .update(&self.instance_id, |i| {
                if let Some(sub) = i.sub_instance_mut(&sub_id) {
                    sub.set_containers(containers);
                }
                i.set_stage_status(stage, status);
                if i.any_stage_failed() {
                    i.status = phase.failed_status();
                } else if i.all_stages_completed() {
                    i.status = phase.completed_status();
                }
            })
            .await?;

        match status {
            StageStatus::Failed => {
                error!(instance_id = %self.instance_id, stage = %stage, failed = ?failed_containers, "Stage failed");
                self.emit(EventKind::StageFailed, stage, json!({ "failed_containers": failed_containers }));
                Err(StageFailureError {
                    instance_id: self.instance_id.clone(),
                    stage,
                    failed_containers,
                }
                .into())
            }
            StageStatus::Completed => {
                info!(instance_id = %self.instance_id, stage = %stage, "Stage completed");
                self.emit(EventKind::StageCompleted, stage, serde_json::Value::Null);
                Ok(status)
            }
            other => {
                warn!(instance_id = %self.instance_id, stage = %stage, status = %other, "Stage ended without a terminal status");
                Ok(other)
            }
        }
    }

    async fn mark_failed(
        &self,
        stage: StageKind,
        failed_containers: Vec<String>,
        cause: &PcflowError,
    ) -> Result<(), PcflowError> {
        let phase = self.phase;
        self.services
            .repository
            .update(&self.instance_id, |i| {
                i.set_stage_status(stage, StageStatus::Failed);
                i.status = phase.failed_status();
            })
            .await?;
        error!(instance_id = %self.instance_id, stage = %stage, error = %cause, "Stage failed");
        self.emit(
            EventKind::StageFailed,
            stage,
            json!({ "failed_containers": failed_containers, "error": cause.to_string() }),
        );
        Ok(())
    }

    fn emit(&self, kind: EventKind, stage: StageKind, detail: serde_json::Value) {
        self.services.events.try_emit(
            LifecycleEvent::new(kind, &self.instance_id)
                .with_phase(self.phase)
                .with_stage(stage)
                .with_detail(detail),
        );
    }
}
