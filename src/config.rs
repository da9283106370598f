//! Supervisor configuration
//!
//! Every field has a default, so a partial YAML file only overrides what it
//! names. With no file, the bundled `config/default.yml` is used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SupervisorError;
use crate::types::PREFLIGHT_REQUIRED_BYTES;

/// How to launch one external engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineCommand {
    /// Executable to run
    pub program: String,
    /// Arguments placed before the per-job arguments
    pub args: Vec<String>,
    /// Working directory for the engine
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl Default for EngineCommand {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert("PYTHONUTF8".to_string(), "1".to_string());
        Self {
            program: "python".to_string(),
            args: vec!["python_engine/main.py".to_string()],
            cwd: None,
            env,
        }
    }
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Where the readiness watcher looks and how long it waits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Candidate subdirectories of the workspace holding carve inputs
    pub subdirs: Vec<String>,
    /// Suffix an artifact must carry for the subdirectory to count as ready
    pub artifact_suffix: String,
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            subdirs: vec!["fs_unalloc".to_string(), "volume_slack".to_string()],
            artifact_suffix: ".bin".to_string(),
            timeout_ms: 60_000,
            interval_ms: 500,
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Primary extraction engine; receives the source path as its last argument
    pub engine: EngineCommand,
    /// Volume carver; the carving phase is skipped when unset
    pub carver: Option<EngineCommand>,
    /// Auxiliary tool directory handed to the carver
    pub tool_dir: Option<PathBuf>,
    /// Temporary-file root; defaults to the platform temp dir
    pub temp_root: Option<PathBuf>,
    pub required_free_bytes: u64,
    /// Base-name prefixes a workspace must carry before it may be deleted
    pub workspace_prefixes: Vec<String>,
    pub terminate_grace_ms: u64,
    pub cleanup_retries: u32,
    pub cleanup_retry_delay_ms: u64,
    pub readiness: ReadinessConfig,
    pub carve_index_name: String,
    pub carve_search_dirs: Vec<String>,
    pub carve_search_depth: usize,
    pub carved_dir: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            engine: EngineCommand::default(),
            carver: None,
            tool_dir: None,
            temp_root: None,
            required_free_bytes: PREFLIGHT_REQUIRED_BYTES,
            workspace_prefixes: vec!["retato_".to_string(), "Virex_".to_string()],
            terminate_grace_ms: 1500,
            cleanup_retries: 2,
            cleanup_retry_delay_ms: 150,
            readiness: ReadinessConfig::default(),
            carve_index_name: "carved_index.json".to_string(),
            carve_search_dirs: vec![
                "carved".to_string(),
                "carved_fixed".to_string(),
                "fs_unalloc".to_string(),
                "volume_slack".to_string(),
            ],
            carve_search_depth: 3,
            carved_dir: "carved".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn cleanup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_retry_delay_ms)
    }

    pub fn with_engine(mut self, engine: EngineCommand) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_carver(mut self, carver: EngineCommand) -> Self {
        self.carver = Some(carver);
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn with_required_free_bytes(mut self, bytes: u64) -> Self {
        self.required_free_bytes = bytes;
        self
    }

    pub fn with_workspace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.workspace_prefixes = vec![prefix.into()];
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_terminate_grace_ms(mut self, ms: u64) -> Self {
        self.terminate_grace_ms = ms;
        self
    }

    fn validate(&self) -> Result<(), SupervisorError> {
        if self.engine.program.trim().is_empty() {
            return Err(SupervisorError::Config("engine.program is empty".into()));
        }
        if self.workspace_prefixes.iter().any(|p| p.trim().is_empty()) {
            return Err(SupervisorError::Config(
                "workspace_prefixes must not contain empty entries".into(),
            ));
        }
        if self.carve_index_name.trim().is_empty() {
            return Err(SupervisorError::Config("carve_index_name is empty".into()));
        }
        if let Some(root) = self.temp_root.as_deref().filter(|r| !r.is_absolute()) {
            return Err(SupervisorError::Config(format!(
                "temp_root must be absolute, got {}",
                root.display()
            )));
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<SupervisorConfig, SupervisorError> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };
    parse_config(&bytes)
}

pub fn parse_config(bytes: &[u8]) -> Result<SupervisorConfig, SupervisorError> {
    let config: SupervisorConfig =
        serde_yaml::from_slice(bytes).map_err(|e| SupervisorError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
