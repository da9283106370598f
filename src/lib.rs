pub mod aggregator;
pub mod carver;
pub mod config;
pub mod control;
pub mod disk_space;
pub mod error;
pub mod events;
pub mod export;
pub mod logging;
pub mod process;
pub mod readiness;
pub mod supervisor;
pub mod types;
pub mod workspace;

pub use config::{EngineCommand, ReadinessConfig, SupervisorConfig, load_config};
pub use error::SupervisorError;
pub use events::{EngineEvent, classify_line};
pub use supervisor::{JobHandle, JobReport, PipelineSupervisor, StartOutcome};
pub use types::{JobSignal, JobState, ResultFile};
