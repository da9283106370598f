//! Virex - recovery pipeline supervisor
//!
//! Command-line host for the supervisor: runs a recovery job against a source
//! image, exports selected results, or clears leftover workspaces.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio::sync::mpsc;

use virex::config::load_config;
use virex::export::{ExportChoice, ExportRequest, run_export};
use virex::logging::init_logging;
use virex::supervisor::{PipelineSupervisor, StartOutcome};
use virex::types::{DiskFullPhase, JobSignal, JobState};
use virex::workspace::WorkspaceManager;

#[derive(Parser, Debug)]
#[command(name = "virex")]
#[command(author, version, about = "Forensic recovery pipeline supervisor", long_about = None)]
struct Cli {
    /// YAML configuration file; the bundled defaults are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recovery job against a disk image or media file
    Recover {
        source: PathBuf,

        /// Print every signal as a JSON line instead of a progress bar
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Copy selected results out of a finished workspace
    Export {
        workspace: PathBuf,
        #[arg(value_parser = parse_choice)]
        choice: ExportChoice,
        destination: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete leftover workspaces under the temp root
    Purge,
}

fn parse_choice(s: &str) -> std::result::Result<ExportChoice, String> {
    s.parse().map_err(|e: virex::error::SupervisorError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Recover { source, json } => run_recover(config, source, json).await,
        Command::Export {
            workspace,
            choice,
            destination,
            files,
        } => {
            let request = ExportRequest {
                workspace,
                choice,
                destination,
                files,
            };
            let report = run_export(&config, &request)
                .await
                .context("Export failed")?;
            println!(
                "Exported {} file(s), {} slack file(s)",
                report.copied, report.copied_slack
            );
            Ok(())
        }
        Command::Purge => {
            let removed = WorkspaceManager::from_config(&config)
                .purge_stale()
                .await
                .context("Failed to scan the temp root")?;
            println!("Removed {} workspace(s)", removed);
            Ok(())
        }
    }
}

async fn run_recover(config: virex::config::SupervisorConfig, source: PathBuf, json: bool) -> Result<()> {
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = cancel_tx.send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    let supervisor = PipelineSupervisor::with_system_probe(config);
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

    let outcome = supervisor
        .start(&source, signal_tx)
        .await
        .with_context(|| format!("Failed to start recovery of {}", source.display()))?;

    let handle = match outcome {
        StartOutcome::Started(handle) => handle,
        StartOutcome::Rejected(rejection) => {
            while let Ok(signal) = signal_rx.try_recv() {
                report_signal(&signal, json, None);
            }
            anyhow::bail!("Recovery not started: {}", rejection.reason());
        }
    };

    let pb = (!json).then(|| {
        let pb = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar().template("[{bar:40.cyan/blue}] {pos:>3}% {msg}") {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb
    });

    loop {
        tokio::select! {
            signal = signal_rx.recv() => match signal {
                Some(signal) => report_signal(&signal, json, pb.as_ref()),
                None => break,
            },
            Some(()) = cancel_rx.recv() => {
                if handle.cancel() {
                    if let Some(pb) = &pb {
                        pb.set_message("cancelling...");
                    }
                }
            }
        }
    }

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let report = handle.join().await;
    if !json {
        println!("Job {} finished: {}", report.id, report.state);
        if let Some(ws) = &report.workspace {
            if report.state == JobState::Done {
                println!("Workspace: {}", ws.display());
            }
        }
    }

    if report.state == JobState::DiskFullFailed {
        anyhow::bail!("Recovery aborted: disk full");
    }
    Ok(())
}

fn report_signal(signal: &JobSignal, json: bool, pb: Option<&ProgressBar>) {
    if json {
        match serde_json::to_string(signal) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to encode signal"),
        }
        return;
    }

    match signal {
        JobSignal::Progress {
            processed,
            total,
            percent,
        } => {
            if let Some(pb) = pb {
                pb.set_position(percent.round() as u64);
                pb.set_message(format!("{}/{}", processed, total));
            }
        }
        JobSignal::AnalysisLocated { dir } => {
            if let Some(pb) = pb {
                pb.println(format!("Analysis directory: {}", dir.display()));
            }
        }
        JobSignal::Results { files } => {
            let print = |line: String| match pb {
                Some(pb) => pb.println(line),
                None => println!("{}", line),
            };
            print(format!("{} result(s)", files.len()));
            for file in files {
                let flag = if file.remux_failed { " (remux failed)" } else { "" };
                print(format!(
                    "  [{}] {} {} bytes{}",
                    file.category,
                    file.path.display(),
                    file.size,
                    flag
                ));
            }
        }
        JobSignal::Done => {}
        JobSignal::Cancelled => eprintln!("Recovery cancelled; workspace removed"),
        JobSignal::DiskFull {
            phase,
            free,
            needed,
        } => match phase {
            DiskFullPhase::Preflight => eprintln!(
                "Not enough free space to start: {} bytes free, {} bytes needed",
                free.unwrap_or(0),
                needed.unwrap_or(0)
            ),
            DiskFullPhase::PreflightError => {
                eprintln!("Could not determine free space on the temp volume")
            }
            DiskFullPhase::During => {
                eprintln!("Engine ran out of disk space; job aborted and workspace removed")
            }
        },
    }
}
