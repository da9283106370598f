//! End-to-end runs of the supervisor against small shell-script engines.
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use virex::config::{EngineCommand, ReadinessConfig, SupervisorConfig};
use virex::disk_space::StaticCapacityProbe;
use virex::supervisor::{JobHandle, PipelineSupervisor};
use virex::types::{DiskFullPhase, ExitIntent, GB, JobSignal, JobState};
use virex::workspace::CleanupOutcome;

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            root: tempdir().unwrap(),
        }
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn workspace(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        path
    }

    fn config(&self, engine: &Path) -> SupervisorConfig {
        SupervisorConfig::default()
            .with_engine(EngineCommand::new("/bin/sh").arg(engine.to_string_lossy()))
            .with_temp_root(self.root())
            .with_terminate_grace_ms(500)
            .with_readiness(ReadinessConfig {
                timeout_ms: 300,
                interval_ms: 20,
                ..ReadinessConfig::default()
            })
    }

    async fn start(&self, config: SupervisorConfig) -> (JobHandle, UnboundedReceiver<JobSignal>) {
        let probe = Arc::new(StaticCapacityProbe {
            free: Some(50 * GB),
            total: 100 * GB,
        });
        let supervisor = PipelineSupervisor::new(config, probe);
        let (tx, rx) = unbounded_channel();
        let handle = supervisor
            .start(self.root().join("image.E01"), tx)
            .await
            .unwrap()
            .into_handle()
            .expect("job should start");
        (handle, rx)
    }
}

fn drain(rx: &mut UnboundedReceiver<JobSignal>) -> Vec<JobSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

fn results_signals(signals: &[JobSignal]) -> Vec<&JobSignal> {
    signals
        .iter()
        .filter(|s| matches!(s, JobSignal::Results { .. }))
        .collect()
}

async fn wait_for_progress(rx: &mut UnboundedReceiver<JobSignal>) -> Vec<JobSignal> {
    let mut seen = Vec::new();
    let wait = async {
        while let Some(signal) = rx.recv().await {
            let is_progress = matches!(signal, JobSignal::Progress { .. });
            seen.push(signal);
            if is_progress {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("engine never reported progress");
    seen
}

#[tokio::test]
async fn test_readiness_timeout_still_reaches_done() {
    let fx = Fixture::new();
    let ws = fx.workspace("Virex_job1");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"ws="{ws}"
mkdir -p "$ws/video"
printf 'x' > "$ws/video/a.mp4"
echo "{{\"tempDir\":\"$ws\"}}"
echo '{{"processed":10,"total":50}}'
echo 'engine warming up'
echo '{{"processed":25,"total":50}}'
echo "{{\"event\":\"extract_done\",\"output_dir\":\"$ws\",\"results\":[{{\"name\":\"a.mp4\",\"path\":\"$ws/video/a.mp4\",\"size\":\"1 KB\"}}]}}"
exit 0"#,
            ws = ws.display()
        ),
    );
    let carver = fx.script("carver.sh", "exit 0");
    let config = fx
        .config(&engine)
        .with_carver(EngineCommand::new("/bin/sh").arg(carver.to_string_lossy()));

    let (handle, mut rx) = fx.start(config).await;
    let report = handle.join().await;
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Done);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.workspace.as_deref(), Some(ws.as_path()));
    assert!(ws.exists(), "done keeps the workspace");

    let percents: Vec<f64> = signals
        .iter()
        .filter_map(|s| match s {
            JobSignal::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![20.0, 50.0]);

    let results = results_signals(&signals);
    assert_eq!(results.len(), 1);
    let JobSignal::Results { files } = results[0] else {
        unreachable!()
    };
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].category, "video");
    assert_eq!(files[0].size, 1024);
    assert_eq!(signals.last(), Some(&JobSignal::Done));
}

#[tokio::test]
async fn test_carve_phase_adds_fallback_results() {
    let fx = Fixture::new();
    let ws = fx.workspace("Virex_carve");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"ws="{ws}"
mkdir -p "$ws/volume_slack"
printf 'raw' > "$ws/volume_slack/vol0.bin"
echo "{{\"tempDir\":\"$ws\"}}"
exit 0"#,
            ws = ws.display()
        ),
    );
    let carver = fx.script(
        "carver.sh",
        r#"mkdir -p "$1/carved"
printf 'aaaa' > "$1/carved/c1.mp4"
printf 'bb' > "$1/carved/c2.mp4"
echo 'carving done'
exit 0"#,
    );
    let config = fx
        .config(&engine)
        .with_carver(EngineCommand::new("/bin/sh").arg(carver.to_string_lossy()));

    let (handle, mut rx) = fx.start(config).await;
    let report = handle.join().await;
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Done);
    let results = results_signals(&signals);
    assert_eq!(results.len(), 1);
    let JobSignal::Results { files } = results[0] else {
        unreachable!()
    };
    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["c1.mp4", "c2.mp4"]);
    assert!(files.iter().all(|f| f.category == "carved"));
}

#[tokio::test]
async fn test_double_cancel_terminates_once_and_cleans_up() {
    let fx = Fixture::new();
    let ws = fx.workspace("Virex_cancel");
    let marker = fx.root().join("term.log");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"trap 'echo TERM >> "{marker}"; exit 143' TERM
ws="{ws}"
mkdir -p "$ws"
echo "{{\"tempDir\":\"$ws\"}}"
echo '{{"processed":1,"total":100}}'
while true; do sleep 0.05; done"#,
            marker = marker.display(),
            ws = ws.display()
        ),
    );

    let (handle, mut rx) = fx.start(fx.config(&engine)).await;
    wait_for_progress(&mut rx).await;
    assert_eq!(handle.state(), JobState::Running);

    assert!(handle.cancel());
    assert!(!handle.cancel());

    let report = handle.join().await;
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Cancelled);
    assert_eq!(report.cleanup, Some(CleanupOutcome::Deleted { attempts: 1 }));
    assert!(!ws.exists());

    let log = fs::read_to_string(&marker).unwrap_or_default();
    assert_eq!(log.lines().filter(|l| *l == "TERM").count(), 1);

    assert_eq!(
        signals,
        vec![JobSignal::Results { files: Vec::new() }, JobSignal::Cancelled]
    );
}

#[tokio::test]
async fn test_cancel_during_carving_cleans_up() {
    let fx = Fixture::new();
    let ws = fx.workspace("Virex_carving");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"ws="{ws}"
mkdir -p "$ws/volume_slack"
printf 'raw' > "$ws/volume_slack/a.bin"
echo "{{\"tempDir\":\"$ws\"}}"
exit 0"#,
            ws = ws.display()
        ),
    );
    let carver = fx.script("carver.sh", "while true; do sleep 0.05; done");
    let config = fx
        .config(&engine)
        .with_carver(EngineCommand::new("/bin/sh").arg(carver.to_string_lossy()));

    let (handle, mut rx) = fx.start(config).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while handle.state() != JobState::Carving {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("carver never started");

    assert!(handle.cancel());
    let report = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("job should end after cancel");
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Cancelled);
    assert_eq!(report.cleanup, Some(CleanupOutcome::Deleted { attempts: 1 }));
    assert!(!ws.exists());
    assert_eq!(
        signals,
        vec![JobSignal::Results { files: Vec::new() }, JobSignal::Cancelled]
    );
}

#[tokio::test]
async fn test_engine_disk_full_aborts_and_cleans_up() {
    let fx = Fixture::new();
    let ws = fx.workspace("Virex_full");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"ws="{ws}"
mkdir -p "$ws/video"
echo "{{\"tempDir\":\"$ws\"}}"
echo '{{"event":"disk_full","free":100,"needed":200,"processed":5,"total":10}}'
while true; do sleep 0.05; done"#,
            ws = ws.display()
        ),
    );

    let (handle, mut rx) = fx.start(fx.config(&engine)).await;
    let control = handle.control();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("job should end after disk full");
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::DiskFullFailed);
    assert_eq!(control.intent(), ExitIntent::DiskFullObserved);
    assert!(!ws.exists());
    assert!(!signals.iter().any(|s| matches!(s, JobSignal::Progress { .. })));
    assert!(signals.contains(&JobSignal::DiskFull {
        phase: DiskFullPhase::During,
        free: Some(100),
        needed: Some(200),
    }));
    assert_eq!(results_signals(&signals).len(), 1);
    assert!(!signals.contains(&JobSignal::Done));
}

#[tokio::test]
async fn test_nonzero_exit_is_still_done() {
    let fx = Fixture::new();
    let engine = fx.script("engine.sh", "echo 'no records at all'\nexit 3");

    let (handle, mut rx) = fx.start(fx.config(&engine)).await;
    let report = handle.join().await;
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Done);
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(
        signals,
        vec![JobSignal::Results { files: Vec::new() }, JobSignal::Done]
    );
}

#[tokio::test]
async fn test_analysis_file_results_are_merged() {
    let fx = Fixture::new();
    let ws = fx.workspace("retato_e01");
    let engine = fx.script(
        "engine.sh",
        &format!(
            r#"ws="{ws}"
mkdir -p "$ws/frames"
cat > "$ws/analysis.json" <<EOF
[{{"name":"f1.jpg","path":"$ws/frames/f1.jpg","size":2048}},{{"path":"$ws/frames/f1.jpg","size":1}},"junk"]
EOF
echo '{{"processed":3,"total":0}}'
echo "{{\"analysisPath\":\"$ws/analysis.json\"}}"
echo '[]'
exit 0"#,
            ws = ws.display()
        ),
    );

    let (handle, mut rx) = fx.start(fx.config(&engine)).await;
    let report = handle.join().await;
    let signals = drain(&mut rx);

    assert_eq!(report.state, JobState::Done);
    assert_eq!(report.workspace.as_deref(), Some(ws.as_path()));
    assert!(signals.contains(&JobSignal::AnalysisLocated { dir: ws.clone() }));
    assert!(signals.contains(&JobSignal::Progress {
        processed: 3,
        total: 0,
        percent: 0.0
    }));

    let results = results_signals(&signals);
    let JobSignal::Results { files } = results[0] else {
        unreachable!()
    };
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size, 2048);
    assert_eq!(files[0].category, "frames");
}

#[tokio::test]
async fn test_cancel_after_done_is_ignored() {
    let fx = Fixture::new();
    let engine = fx.script("engine.sh", "exit 0");

    let (handle, _rx) = fx.start(fx.config(&engine)).await;
    let control = handle.control();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !handle.state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(!handle.cancel());
    assert!(!control.is_set());
    assert_eq!(handle.join().await.state, JobState::Done);
}
