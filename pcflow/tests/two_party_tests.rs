//! End-to-end runs of both parties over scripted containers.

use pcflow::config::binaries;
use pcflow::events::{CollectingEventSink, EventKind};
use pcflow::graph::FlowEntry;
use pcflow::prelude::*;
use pcflow::testing::{fixtures, ScriptedContainerBackend};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn orchestrator_over(
    backend: &Arc<ScriptedContainerBackend>,
    exchange: Arc<dyn AddressExchange>,
    config: OrchestratorConfig,
) -> (Orchestrator, Arc<CollectingEventSink>) {
    let events = Arc::new(CollectingEventSink::new());
    let services = Services::builder(backend.clone() as Arc<dyn ContainerBackend>)
        .with_config(config)
        .with_exchange(exchange)
        .with_events(events.clone())
        .build();
    (Orchestrator::new(services), events)
}

#[tokio::test]
async fn test_publisher_runs_every_phase_in_order() {
    let backend = Arc::new(ScriptedContainerBackend::new());
    let exchange: Arc<dyn AddressExchange> = Arc::new(InMemoryAddressExchange::new());
    let (orchestrator, events) = orchestrator_over(&backend, exchange, fixtures::test_config());
    assert_ok!(orchestrator.create_instance(fixtures::publisher_instance("pub-1")).await);

    for phase in Phase::ALL {
        let instance = assert_ok!(
            orchestrator
                .run_phase("pub-1", phase, RunPhaseOptions::default())
                .await
        );
        assert_eq!(instance.status, phase.completed_status());
        assert_eq!(instance.retry_counter, 0);
    }

    assert_eq!(
        backend.started_binaries(),
        vec![
            binaries::SHARDER,
            binaries::PID_PREPARER,
            binaries::PID_SERVER,
            binaries::ID_COMBINER,
            binaries::COMPUTE,
            binaries::AGGREGATOR,
            binaries::POST_PROCESSOR,
        ]
    );

    let instance = assert_ok!(orchestrator.get_instance("pub-1").await);
    let prepare = instance.last_stage_run(StageKind::Prepare).unwrap();
    assert_eq!(
        prepare.input_paths,
        vec!["/data/out/pub-1_publisher_sharded".to_string()]
    );
    assert_eq!(
        events.of_kind(EventKind::PhaseCompleted).len(),
        Phase::ALL.len()
    );
}

#[tokio::test]
async fn test_partner_follows_publisher_addresses() {
    let exchange: Arc<dyn AddressExchange> = Arc::new(InMemoryAddressExchange::new());
    let publisher_backend = Arc::new(ScriptedContainerBackend::new());
    let partner_backend = Arc::new(ScriptedContainerBackend::new());
    let (publisher, _) =
        orchestrator_over(&publisher_backend, exchange.clone(), fixtures::test_config());
    let (partner, _) = orchestrator_over(&partner_backend, exchange, fixtures::test_config());

    assert_ok!(publisher.create_instance(fixtures::publisher_instance("pub-1")).await);
    assert_ok!(partner.create_instance(fixtures::partner_instance("par-1")).await);

    let publisher_run = publisher.run_phase("pub-1", Phase::IdMatch, RunPhaseOptions::default());
    let partner_run = async {
        let server_ips = partner.await_peer_addresses("pub-1", Phase::IdMatch).await?;
        partner
            .run_phase(
                "par-1",
                Phase::IdMatch,
                RunPhaseOptions::default().with_server_ips(server_ips),
            )
            .await
    };
    let (published, joined) = tokio::join!(publisher_run, partner_run);
    assert_eq!(assert_ok!(published).status, InstanceStatus::IdMatchCompleted);
    let partner_instance = assert_ok!(joined);
    assert_eq!(partner_instance.status, InstanceStatus::IdMatchCompleted);

    // shard (1), prepare (2), then the PID servers at .4 and .5
    let client = partner_instance.last_stage_run(StageKind::RunPid).unwrap();
    assert_eq!(client.server_ips, vec!["10.0.0.4".to_string(), "10.0.0.5".to_string()]);
    assert_eq!(client.game_args[0]["company"], "10.0.0.4:15200");
    assert_eq!(client.game_args[1]["company"], "10.0.0.5:15200");
}

#[tokio::test]
async fn test_partner_compute_joins_publisher_fleet() {
    let exchange: Arc<dyn AddressExchange> = Arc::new(InMemoryAddressExchange::new());
    let publisher_backend = Arc::new(ScriptedContainerBackend::new());
    let partner_backend = Arc::new(ScriptedContainerBackend::new());
    let (publisher, _) =
        orchestrator_over(&publisher_backend, exchange.clone(), fixtures::test_config());
    let (partner, _) = orchestrator_over(&partner_backend, exchange, fixtures::test_config());

    let mut pub_instance = fixtures::publisher_instance("pub-1");
    pub_instance.status = InstanceStatus::PrepareCompleted;
    let mut par_instance = fixtures::partner_instance("par-1");
    par_instance.status = InstanceStatus::PrepareCompleted;
    assert_ok!(publisher.create_instance(pub_instance).await);
    assert_ok!(partner.create_instance(par_instance).await);

    let err = assert_err!(
        partner
            .run_phase("par-1", Phase::Compute, RunPhaseOptions::default())
            .await
    );
    assert!(matches!(err, PcflowError::MissingServerIps(_)));

    assert_ok!(
        publisher
            .run_phase("pub-1", Phase::Compute, RunPhaseOptions::default())
            .await
    );
    let server_ips = assert_ok!(partner.await_peer_addresses("pub-1", Phase::Compute).await);
    let instance = assert_ok!(
        partner
            .run_phase(
                "par-1",
                Phase::Compute,
                RunPhaseOptions::default().with_server_ips(server_ips.clone()),
            )
            .await
    );

    assert_eq!(instance.status, InstanceStatus::ComputeCompleted);
    let run = instance.last_phase_run(Phase::Compute).unwrap();
    assert_eq!(run.server_ips, server_ips);
    assert_eq!(run.game_args[0]["server_ip"], format!("{}:15300", server_ips[0]));
}

#[tokio::test]
async fn test_independent_stages_share_one_wave() {
    let backend = Arc::new(ScriptedContainerBackend::new());
    let flows = FlowTable::new().with_flow(
        Role::Publisher,
        Protocol::UnionPid,
        FlowEntry::from_adjacency(&[
            (StageKind::Shard, &[]),
            (StageKind::Prepare, &[]),
            (StageKind::RunPid, &[]),
        ]),
    );
    let (services, events) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
    let services = Services {
        flows: Arc::new(flows),
        ..services
    };
    let orchestrator = Orchestrator::new(services);
    assert_ok!(orchestrator.create_instance(fixtures::publisher_instance("pub-1")).await);

    let instance = assert_ok!(
        orchestrator
            .run_phase("pub-1", Phase::IdMatch, RunPhaseOptions::default())
            .await
    );

    assert_eq!(instance.status, InstanceStatus::IdMatchCompleted);
    assert_eq!(events.of_kind(EventKind::StageStarted).len(), 3);
    for stage in StageKind::ALL {
        let run = instance.last_stage_run(stage).unwrap();
        assert_eq!(run.input_paths, vec![instance.input_path.clone()]);
    }
}

#[tokio::test]
async fn test_retry_counter_tracks_failures_and_resets() {
    let backend = Arc::new(ScriptedContainerBackend::new());
    backend.script_binary(
        binaries::AGGREGATOR,
        vec![vec![ContainerStatus::Failed], vec![ContainerStatus::Failed]],
    );
    let (services, _) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
    let orchestrator = Orchestrator::new(services);
    let mut instance = fixtures::publisher_instance("pub-1");
    instance.status = InstanceStatus::ComputeCompleted;
    assert_ok!(orchestrator.create_instance(instance).await);

    let mut counters = Vec::new();
    for _ in 0..3 {
        let instance = assert_ok!(
            orchestrator
                .run_phase("pub-1", Phase::Aggregate, RunPhaseOptions::default())
                .await
        );
        counters.push((instance.retry_counter, instance.status));
    }
    assert_eq!(
        counters,
        vec![
            (0, InstanceStatus::AggregateFailed),
            (1, InstanceStatus::AggregateFailed),
            (2, InstanceStatus::AggregateCompleted),
        ]
    );

    let instance = assert_ok!(
        orchestrator
            .run_phase("pub-1", Phase::PostProcess, RunPhaseOptions::default())
            .await
    );
    assert_eq!(instance.retry_counter, 0);
    let ids: Vec<&str> = instance.sub_instances.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "pub-1_aggregate0",
            "pub-1_aggregate1",
            "pub-1_aggregate2",
            "pub-1_post_process0",
        ]
    );
}

#[tokio::test]
async fn test_started_instance_rejects_every_phase() {
    let backend = Arc::new(ScriptedContainerBackend::new().with_default_script(vec![ContainerStatus::Started]));
    let (services, _) = fixtures::test_services(backend.clone() as Arc<dyn ContainerBackend>);
    let orchestrator = Orchestrator::new(services);
    let mut instance = fixtures::publisher_instance("pub-1");
    instance.status = InstanceStatus::IdMatchCompleted;
    assert_ok!(orchestrator.create_instance(instance).await);

    let running = assert_ok!(
        orchestrator
            .run_phase(
                "pub-1",
                Phase::Prepare,
                RunPhaseOptions::default().with_wait_for_containers(false),
            )
            .await
    );
    assert_eq!(running.status, InstanceStatus::PrepareStarted);

    for phase in Phase::ALL {
        let err = assert_err!(
            orchestrator
                .run_phase("pub-1", phase, RunPhaseOptions::default().with_dry_run(true))
                .await
        );
        assert!(matches!(err, PcflowError::InvalidState(_)));
    }

    let cancelled = assert_ok!(orchestrator.cancel_current_phase("pub-1").await);
    assert_eq!(cancelled.status, InstanceStatus::PrepareFailed);
}
