//! Configuration loading and validation.
//!
//! Configuration comes from an optional JSON file with environment
//! variable overrides on top (`THRIFTHIVE_*`). Validation is eager: an
//! unknown worker type or a duplicate listener name is rejected at load
//! time, not when the first worker is spawned.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_MAX_FRAME_SIZE;

/// Execution mode of the worker request loop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// Requests are processed one at a time, in arrival order.
    Sync,
    /// Requests run as concurrent tasks, bounded by the concurrency cap.
    Concurrent,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Concurrent => write!(f, "concurrent"),
        }
    }
}

impl WorkerType {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "sync" => Ok(Self::Sync),
            "concurrent" => Ok(Self::Concurrent),
            other => bail!("unknown worker type {other:?} (expected \"sync\" or \"concurrent\")"),
        }
    }
}

/// A named TCP endpoint the master accepts clients on.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ListenerConfig {
    /// Identifier used by administrative calls and worker-side state.
    pub name: String,
    /// Address to bind. Port 0 picks an ephemeral port.
    pub addr: SocketAddr,
    /// Whether the acceptor is armed at boot.
    #[serde(default = "default_started")]
    pub started: bool,
}

fn default_started() -> bool {
    true
}

/// Configuration for the thrifthive master and its workers.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Number of worker processes kept alive.
    pub workers: usize,
    /// Worker request-loop mode.
    pub worker_type: WorkerType,
    /// Recycle workers older than this many seconds. `None` disables recycling.
    pub worker_ttl: Option<u64>,
    /// Seconds the pool may take to become ready before the master gives up.
    pub process_start_timeout: u64,
    /// Graceful stop window in seconds; SIGKILL follows it.
    pub process_stop_timeout: u64,
    /// Per-worker cap on in-flight requests.
    pub concurrency: usize,
    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,
    /// Listeners to bind at startup.
    pub listeners: Vec<ListenerConfig>,
    /// Worker executable. Defaults to the current binary.
    pub worker_command: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_type: WorkerType::Sync,
            worker_ttl: None,
            process_start_timeout: 30,
            process_stop_timeout: 10,
            concurrency: 4,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            listeners: Vec::new(),
            worker_command: None,
        }
    }
}

impl Config {
    /// Loads configuration from an optional file, applies environment
    /// overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("read config file: {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("parse config file: {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(workers) = env::var("THRIFTHIVE_WORKERS") {
            self.workers = workers
                .parse()
                .context("THRIFTHIVE_WORKERS is not an integer")?;
        }

        if let Ok(worker_type) = env::var("THRIFTHIVE_WORKER_TYPE") {
            self.worker_type = WorkerType::parse(&worker_type)?;
        }

        if let Ok(ttl) = env::var("THRIFTHIVE_WORKER_TTL") {
            self.worker_ttl = Some(ttl.parse().context("THRIFTHIVE_WORKER_TTL is not an integer")?);
        }

        if let Ok(timeout) = env::var("THRIFTHIVE_PROCESS_START_TIMEOUT") {
            self.process_start_timeout = timeout
                .parse()
                .context("THRIFTHIVE_PROCESS_START_TIMEOUT is not an integer")?;
        }

        if let Ok(timeout) = env::var("THRIFTHIVE_PROCESS_STOP_TIMEOUT") {
            self.process_stop_timeout = timeout
                .parse()
                .context("THRIFTHIVE_PROCESS_STOP_TIMEOUT is not an integer")?;
        }

        if let Ok(concurrency) = env::var("THRIFTHIVE_CONCURRENCY") {
            self.concurrency = concurrency
                .parse()
                .context("THRIFTHIVE_CONCURRENCY is not an integer")?;
        }

        if let Ok(max_frame) = env::var("THRIFTHIVE_MAX_FRAME_SIZE") {
            self.max_frame_size = max_frame
                .parse()
                .context("THRIFTHIVE_MAX_FRAME_SIZE is not an integer")?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_frame_size == 0 {
            bail!("max_frame_size must be positive");
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            if listener.name.is_empty() {
                bail!("listener names must not be empty");
            }
            if !names.insert(listener.name.as_str()) {
                bail!("duplicate listener name {:?}", listener.name);
            }
        }

        Ok(())
    }

    /// Resolved worker executable path.
    pub fn worker_command(&self) -> Result<PathBuf> {
        match &self.worker_command {
            Some(path) => Ok(path.clone()),
            None => env::current_exe().context("resolve current executable for worker command"),
        }
    }
}
