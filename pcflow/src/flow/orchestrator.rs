//! Phase-level entry point for one party.

use super::partial_retry::partial_container_retry;
use super::phase_service::{PhaseRun, PhaseService};
use super::stage_flow::{ComputationStageFlow, TransitionKind};
use crate::core::{ComputationInstance, InstanceStatus, Phase, Role};
use crate::errors::{CancelInvariantError, InvalidStateError, MissingServerIpsError, PcflowError};
use crate::events::{EventKind, LifecycleEvent};
use crate::exchange;
use crate::services::Services;
use crate::validation::{default_validators, run_preflight, PreflightValidator};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Options for [`Orchestrator::run_phase`].
#[derive(Debug, Clone)]
pub struct RunPhaseOptions {
    /// Publisher addresses; required by the partner for joint work.
    pub server_ips: Vec<String>,
    /// Admit the phase even when the status does not allow it.
    pub dry_run: bool,
    /// Wait for containers before returning.
    pub wait_for_containers: bool,
    /// Overrides the phase's configured container timeout.
    pub timeout: Option<Duration>,
}

impl Default for RunPhaseOptions {
    fn default() -> Self {
        Self {
            server_ips: Vec::new(),
            dry_run: false,
            wait_for_containers: true,
            timeout: None,
        }
    }
}

impl RunPhaseOptions {
    /// Sets the publisher addresses.
    #[must_use]
    pub fn with_server_ips(mut self, server_ips: Vec<String>) -> Self {
        self.server_ips = server_ips;
        self
    }

    /// Sets the dry-run flag.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets whether to wait for containers.
    #[must_use]
    pub fn with_wait_for_containers(mut self, wait: bool) -> Self {
        self.wait_for_containers = wait;
        self
    }

    /// Sets the container timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Drives the phases of computation instances for one party.
#[derive(Clone)]
pub struct Orchestrator {
    services: Services,
    flow: ComputationStageFlow,
    validators: Arc<Vec<Box<dyn PreflightValidator>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("services", &self.services)
            .field("flow", &self.flow)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with the standard flow and default validators.
    #[must_use]
    pub fn new(services: Services) -> Self {
        let flow = ComputationStageFlow::standard(&services.config.phase_timeouts);
        Self {
            services,
            flow,
            validators: Arc::new(default_validators()),
        }
    }

    /// Replaces the pre-flight validators.
    #[must_use]
    pub fn with_validators(mut self, validators: Vec<Box<dyn PreflightValidator>>) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    /// The shared collaborators.
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The phase state machine.
    #[must_use]
    pub fn flow(&self) -> &ComputationStageFlow {
        &self.flow
    }

    /// Persists a new instance.
    pub async fn create_instance(
        &self,
        instance: ComputationInstance,
    ) -> Result<ComputationInstance, PcflowError> {
        self.services.repository.create(&instance).await?;
        info!(
            instance_id = %instance.instance_id,
            role = %instance.role,
            protocol = %instance.protocol,
            "Instance created"
        );
        Ok(instance)
    }

    /// Reads an instance as persisted.
    pub async fn get_instance(&self, instance_id: &str) -> Result<ComputationInstance, PcflowError> {
        Ok(self.services.repository.read(instance_id).await?)
    }

    /// Refreshes the status of an in-flight phase from container state.
    pub async fn update_instance(&self, instance_id: &str) -> Result<ComputationInstance, PcflowError> {
        let instance = self.services.repository.read(instance_id).await?;
        let Some(phase) = instance.status.phase().filter(|_| instance.status.is_started()) else {
            return Ok(instance);
        };

        let before = instance.status;
        let status = self.service(phase, &instance).get_status(&self.services, instance_id).await?;
        if status != before {
            self.emit_outcome(instance_id, phase, status);
        }
        self.get_instance(instance_id).await
    }

    /// Deletes an instance.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), PcflowError> {
        self.services.repository.delete(instance_id).await?;
        info!(instance_id = %instance_id, "Instance deleted");
        Ok(())
    }

    /// Runs one phase of an instance.
    ///
    /// The transition is validated and the started status persisted in one
    /// locked update; nothing is written when validation fails. Errors from
    /// the phase's work leave the instance at the phase's failed status.
    #[instrument(skip(self, options), fields(dry_run = options.dry_run))]
    pub async fn run_phase(
        &self,
        instance_id: &str,
        phase: Phase,
        options: RunPhaseOptions,
    ) -> Result<ComputationInstance, PcflowError> {
        let spec = self.flow.spec(phase);
        let current = self.services.repository.read(instance_id).await?;
        let service = self.service(phase, &current);

        if spec.is_joint_stage && current.role == Role::Partner && options.server_ips.is_empty() {
            return Err(MissingServerIpsError { phase }.into());
        }
        if phase == Phase::IdMatch {
            self.services.flows.get(current.role, current.protocol)?;
        }
        let warnings = run_preflight(&self.validators, &current);

        let partial_enabled = self.services.config.partial_container_retry_enabled;
        let (instance, (kind, retry_game_args)) = self
            .services
            .repository
            .try_update(instance_id, |i| {
                let kind = self.flow.validate_transition(i, phase, options.dry_run)?;
                let retry = match kind {
                    TransitionKind::Retry => partial_container_retry(i, phase, partial_enabled),
                    TransitionKind::Advance | TransitionKind::Override => None,
                };
                i.status = spec.started_status;
                i.current_phase = Some(phase);
                Ok::<_, PcflowError>((kind, retry))
            })
            .await?;

        info!(
            instance_id = %instance_id,
            phase = %phase,
            ?kind,
            retry_counter = instance.retry_counter,
            partial = retry_game_args.as_ref().map(Vec::len),
            "Phase started"
        );
        self.emit(
            LifecycleEvent::new(EventKind::PhaseStarted, instance_id)
                .with_phase(phase)
                .with_detail(json!({
                    "retry_counter": instance.retry_counter,
                    "transition": format!("{kind:?}").to_lowercase(),
                    "warnings": warnings,
                })),
        );

        let run = PhaseRun {
            server_ips: options.server_ips,
            wait_for_containers: options.wait_for_containers,
            timeout: options.timeout.unwrap_or(spec.default_timeout),
            retry_game_args,
        };

        if let Err(e) = service.run(&self.services, &instance, &run).await {
            error!(instance_id = %instance_id, phase = %phase, error = %e, "Phase failed");
            self.services
                .repository
                .update(instance_id, |i| i.status = spec.failed_status)
                .await?;
            let info = e.info();
            self.emit(
                LifecycleEvent::new(EventKind::PhaseFailed, instance_id)
                    .with_phase(phase)
                    .with_detail(json!({
                        "error": e.to_string(),
                        "code": info.code,
                        "fix_hint": info.fix_hint,
                    })),
            );
            return Err(e);
        }

        let status = service.get_status(&self.services, instance_id).await?;
        self.emit_outcome(instance_id, phase, status);
        self.get_instance(instance_id).await
    }

    /// Stops the containers of the in-flight phase's latest run.
    ///
    /// Completed stages and phases are never rolled back; the instance must
    /// end at the phase's failed status.
    #[instrument(skip(self))]
    pub async fn cancel_current_phase(&self, instance_id: &str) -> Result<ComputationInstance, PcflowError> {
        let instance = self.services.repository.read(instance_id).await?;
        let Some(phase) = instance.status.phase().filter(|_| instance.status.is_started()) else {
            return Err(InvalidStateError {
                current: instance.status,
                target: instance.current_phase.unwrap_or(Phase::IdMatch),
                reason: "no phase is running".to_string(),
            }
            .into());
        };

        let containers = instance
            .last_sub_instance()
            .map(|sub| sub.containers.clone())
            .unwrap_or_default();
        let failures = self.services.supervisor.stop(&containers).await;
        if failures > 0 {
            warn!(instance_id = %instance_id, failures, "Some containers could not be stopped");
        }

        let expected = phase.failed_status();
        let actual = self
            .service(phase, &instance)
            .get_status(&self.services, instance_id)
            .await?;
        if actual != expected {
            error!(instance_id = %instance_id, phase = %phase, %actual, "Cancellation did not fail the phase");
            return Err(CancelInvariantError {
                instance_id: instance_id.to_string(),
                phase,
                actual,
                expected,
            }
            .into());
        }

        info!(instance_id = %instance_id, phase = %phase, stopped = containers.len(), "Phase cancelled");
        self.emit(
            LifecycleEvent::new(EventKind::PhaseCancelled, instance_id)
                .with_phase(phase)
                .with_detail(json!({ "stopped": containers.len(), "stop_failures": failures })),
        );
        self.get_instance(instance_id).await
    }

    /// Waits for the addresses `peer_instance_id` publishes for `phase`.
    pub async fn await_peer_addresses(
        &self,
        peer_instance_id: &str,
        phase: Phase,
    ) -> Result<Vec<String>, PcflowError> {
        let key = exchange::phase_key(peer_instance_id, phase);
        let addresses = self
            .services
            .exchange
            .wait(&key, self.services.config.address_wait())
            .await?;
        info!(key = %key, count = addresses.len(), "Received peer addresses");
        Ok(addresses)
    }

    fn service(&self, phase: Phase, instance: &ComputationInstance) -> PhaseService {
        PhaseService::for_phase(phase, instance.role, instance.protocol)
    }

    fn emit_outcome(&self, instance_id: &str, phase: Phase, status: InstanceStatus) {
        let kind = if status == phase.completed_status() {
            EventKind::PhaseCompleted
        } else if status == phase.failed_status() {
            EventKind::PhaseFailed
        } else {
            return;
        };
        info!(instance_id = %instance_id, phase = %phase, status = %status, "Phase finished");
        self.emit(
            LifecycleEvent::new(kind, instance_id)
                .with_phase(phase)
                .with_detail(json!({ "status": status.to_string() })),
        );
    }

    fn emit(&self, event: LifecycleEvent) {
        self.services.events.try_emit(event);
    }
}
