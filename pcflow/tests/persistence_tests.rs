//! Runs that survive a restart through the JSON file store.

use pcflow::config::binaries;
use pcflow::exchange::FileAddressExchange;
use pcflow::prelude::*;
use pcflow::store::JsonFileInstanceStore;
use pcflow::testing::{fixtures, ScriptedContainerBackend};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn orchestrator_at(root: &Path, backend: &Arc<ScriptedContainerBackend>) -> Orchestrator {
    let store = assert_ok!(JsonFileInstanceStore::open(root.join("instances")).await);
    let exchange = FileAddressExchange::new(root).with_poll_interval(Duration::from_millis(5));
    let services = Services::builder(backend.clone() as Arc<dyn ContainerBackend>)
        .with_config(fixtures::test_config())
        .with_store(Arc::new(store))
        .with_exchange(Arc::new(exchange))
        .with_events(Arc::new(NoOpEventSink))
        .build();
    Orchestrator::new(services)
}

#[tokio::test]
async fn test_failed_id_match_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first_backend = Arc::new(ScriptedContainerBackend::new());
    first_backend.script_binary(binaries::PID_SERVER, vec![vec![ContainerStatus::Failed]]);
    let first = orchestrator_at(dir.path(), &first_backend).await;
    assert_ok!(first.create_instance(fixtures::publisher_instance("pub-1")).await);

    let err = assert_err!(
        first
            .run_phase("pub-1", Phase::IdMatch, RunPhaseOptions::default())
            .await
    );
    assert!(matches!(err, PcflowError::StageFailure(_)));
    drop(first);

    let second_backend = Arc::new(ScriptedContainerBackend::new());
    let second = orchestrator_at(dir.path(), &second_backend).await;
    let stored = assert_ok!(second.get_instance("pub-1").await);
    assert_eq!(stored.status, InstanceStatus::IdMatchFailed);
    assert_eq!(stored.stage_status(StageKind::Shard), StageStatus::Completed);
    assert_eq!(stored.stage_status(StageKind::Prepare), StageStatus::Completed);
    assert_eq!(stored.stage_status(StageKind::RunPid), StageStatus::Failed);

    let resumed = assert_ok!(
        second
            .run_phase("pub-1", Phase::IdMatch, RunPhaseOptions::default())
            .await
    );
    assert_eq!(resumed.status, InstanceStatus::IdMatchCompleted);
    assert_eq!(resumed.retry_counter, 1);
    assert_eq!(second_backend.started_binaries(), vec![binaries::PID_SERVER]);
    assert_eq!(
        resumed.last_stage_run(StageKind::RunPid).unwrap().id,
        "pub-1_id_match1_run_pid"
    );
}

#[tokio::test]
async fn test_addresses_cross_processes_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedContainerBackend::new());
    let publisher = orchestrator_at(dir.path(), &backend).await;

    let mut instance = fixtures::publisher_instance("pub-1");
    instance.status = InstanceStatus::PrepareCompleted;
    assert_ok!(publisher.create_instance(instance).await);
    assert_ok!(
        publisher
            .run_phase("pub-1", Phase::Compute, RunPhaseOptions::default())
            .await
    );

    let partner_side = FileAddressExchange::new(dir.path());
    let addresses = assert_ok!(
        partner_side
            .wait("pub-1/compute", Duration::from_millis(100))
            .await
    );
    assert_eq!(addresses, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
}

#[tokio::test]
async fn test_delete_removes_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedContainerBackend::new());
    let orchestrator = orchestrator_at(dir.path(), &backend).await;
    assert_ok!(orchestrator.create_instance(fixtures::publisher_instance("pub-1")).await);

    assert_ok!(orchestrator.delete_instance("pub-1").await);
    let err = assert_err!(orchestrator.get_instance("pub-1").await);
    assert!(matches!(err, PcflowError::Store(_)));
}
