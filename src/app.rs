//! The application context: configuration plus the service table.
//!
//! There is no process-global "current app"; an [`App`] is built
//! explicitly and handed to the components that need it, so tests can
//! instantiate several independent contexts side by side.
//!
//! Master and worker run the same binary and build the same [`App`]. The
//! master ships an [`AppSnapshot`] (an explicit, schema'd configuration
//! snapshot, never a serialized live object) over the handshake stream;
//! the worker matches the snapshot's service names against the factories
//! compiled into its registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::{Config, WorkerType};
use crate::worker::processor::FrameProcessor;

/// Builds a processor instance inside a worker process.
pub type ProcessorFactory = Arc<dyn Fn() -> Arc<dyn FrameProcessor> + Send + Sync>;

/// Named processor factories, keyed by service name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ProcessorFactory>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Re-registering a name replaces the factory.
    pub fn register(&mut self, name: impl Into<String>, factory: ProcessorFactory) {
        self.services.insert(name.into(), factory);
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Build the processor for one service.
    pub fn build(&self, name: &str) -> Option<Arc<dyn FrameProcessor>> {
        self.services.get(name).map(|factory| factory.as_ref()())
    }

    /// Build the worker's dispatching processor.
    ///
    /// The request frames carry no service discriminator, so routing
    /// between services is the processor's concern: a registry with more
    /// than one entry must instead register a single multiplexing root
    /// (the Thrift library's multiplexed processor handles IDL services).
    pub fn dispatcher(&self) -> Result<(String, Arc<dyn FrameProcessor>)> {
        let mut iter = self.services.iter();
        let (name, factory) = match iter.next() {
            Some(entry) => entry,
            None => bail!("no services registered"),
        };
        if iter.next().is_some() {
            bail!(
                "multiple services registered; register a single multiplexing \
                 root processor instead"
            );
        }
        Ok((name.clone(), factory.as_ref()()))
    }
}

/// Configuration snapshot shipped to a worker during the handshake.
///
/// Length-prefixed JSON on the wire. Deliberately plain data: service
/// names and the config values the worker needs, nothing executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSnapshot {
    /// Worker request-loop mode.
    pub worker_type: WorkerType,
    /// Per-worker concurrency cap.
    pub concurrency: usize,
    /// Frame size cap for the IPC streams.
    pub max_frame_size: usize,
    /// Services the worker must be able to build.
    pub services: Vec<String>,
}

/// The application: configuration and service table.
pub struct App {
    /// Resolved configuration.
    pub config: Config,
    /// Service table shared by master and worker code paths.
    pub services: ServiceRegistry,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish()
    }
}

impl App {
    /// Create an app with an empty service table.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            services: ServiceRegistry::new(),
        }
    }

    /// Register a service. Returns `self` for chaining.
    pub fn service(mut self, name: impl Into<String>, factory: ProcessorFactory) -> Self {
        self.services.register(name, factory);
        self
    }

    /// Snapshot to ship to a worker during the handshake.
    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            worker_type: self.config.worker_type,
            concurrency: self.config.concurrency,
            max_frame_size: self.config.max_frame_size,
            services: self.services.names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::processor::EchoProcessor;

    fn echo_factory() -> ProcessorFactory {
        Arc::new(|| Arc::new(EchoProcessor))
    }

    #[test]
    fn test_snapshot_lists_services() {
        let app = App::new(Config::default()).service("echo", echo_factory());
        let snapshot = app.snapshot();
        assert_eq!(snapshot.services, vec!["echo".to_string()]);
        assert_eq!(snapshot.concurrency, app.config.concurrency);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let app = App::new(Config::default()).service("echo", echo_factory());
        let json = serde_json::to_vec(&app.snapshot()).unwrap();
        let loaded: AppSnapshot = serde_json::from_slice(&json).unwrap();
        assert_eq!(loaded.services, vec!["echo".to_string()]);
        assert_eq!(loaded.max_frame_size, app.config.max_frame_size);
    }

    #[test]
    fn test_dispatcher_requires_exactly_one_root() {
        let empty = ServiceRegistry::new();
        assert!(empty.dispatcher().is_err());

        let mut single = ServiceRegistry::new();
        single.register("echo", echo_factory());
        let (name, _processor) = single.dispatcher().unwrap();
        assert_eq!(name, "echo");

        let mut double = ServiceRegistry::new();
        double.register("a", echo_factory());
        double.register("b", echo_factory());
        assert!(double.dispatcher().is_err());
    }

    #[test]
    fn test_build_unknown_service_is_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.build("nope").is_none());
    }
}
