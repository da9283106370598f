use std::sync::Arc;

use tempfile::tempdir;
use tokio::sync::mpsc;

use virex::config::{EngineCommand, SupervisorConfig};
use virex::disk_space::{StaticCapacityProbe, check_capacity};
use virex::error::SupervisorError;
use virex::supervisor::{PipelineSupervisor, StartOutcome};
use virex::types::{DiskFullPhase, GB, JobSignal};

fn missing_engine() -> EngineCommand {
    // Spawning this would fail, so a rejected start proves nothing was spawned.
    EngineCommand::new("/nonexistent/virex-engine")
}

#[tokio::test]
async fn test_preflight_one_gib_free_rejects_with_disk_full() {
    let root = tempdir().unwrap();
    let config = SupervisorConfig::default()
        .with_engine(missing_engine())
        .with_temp_root(root.path());
    let probe = Arc::new(StaticCapacityProbe {
        free: Some(GB),
        total: 100 * GB,
    });
    let supervisor = PipelineSupervisor::new(config, probe);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = supervisor.start("/evidence/disk.E01", tx).await.unwrap();

    assert!(!outcome.started());
    assert_eq!(outcome.reason(), Some("disk_full"));
    assert!(matches!(outcome, StartOutcome::Rejected(_)));
    assert_eq!(
        rx.recv().await,
        Some(JobSignal::DiskFull {
            phase: DiskFullPhase::Preflight,
            free: Some(GB),
            needed: Some(5 * GB),
        })
    );
    assert_eq!(rx.recv().await, None);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_preflight_query_failure_is_distinct() {
    let root = tempdir().unwrap();
    let config = SupervisorConfig::default()
        .with_engine(missing_engine())
        .with_temp_root(root.path());
    let probe = Arc::new(StaticCapacityProbe {
        free: None,
        total: 0,
    });
    let supervisor = PipelineSupervisor::new(config, probe);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = supervisor.start("/evidence/disk.E01", tx).await.unwrap();

    assert_eq!(outcome.reason(), Some("disk_check_failed"));
    assert!(matches!(
        rx.recv().await,
        Some(JobSignal::DiskFull {
            phase: DiskFullPhase::PreflightError,
            free: None,
            ..
        })
    ));
}

#[tokio::test]
async fn test_spawn_failure_surfaces_as_error() {
    let root = tempdir().unwrap();
    let config = SupervisorConfig::default()
        .with_engine(missing_engine())
        .with_temp_root(root.path());
    let probe = Arc::new(StaticCapacityProbe {
        free: Some(10 * GB),
        total: 100 * GB,
    });
    let supervisor = PipelineSupervisor::new(config, probe);
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = supervisor
        .start("/evidence/disk.E01", tx)
        .await
        .err()
        .expect("spawn should fail");
    assert!(matches!(err, SupervisorError::EngineSpawn { .. }));
}

#[test]
fn test_check_capacity_threshold_is_inclusive() {
    let probe = StaticCapacityProbe {
        free: Some(5 * GB),
        total: 10 * GB,
    };
    let check = check_capacity(&probe, std::path::Path::new("/tmp"), 5 * GB).unwrap();
    assert!(check.ok);
    assert_eq!(check.total, 10 * GB);

    let check = check_capacity(&probe, std::path::Path::new("/tmp"), 5 * GB + 1).unwrap();
    assert!(!check.ok);
}

#[cfg(unix)]
#[test]
fn test_system_probe_reports_real_volume() {
    use virex::disk_space::{CapacityProbe, SystemCapacityProbe};

    let dir = tempdir().unwrap();
    let capacity = SystemCapacityProbe
        .capacity(&dir.path().join("not-created-yet"))
        .unwrap();
    assert!(capacity.total > 0);
    assert!(capacity.free <= capacity.total);
}
