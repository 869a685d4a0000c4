// Library modules
pub mod app;
pub mod broker;
pub mod config;
pub mod constants;
pub mod error;
pub mod manager;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod wire;
pub mod worker;

// Re-export commonly used types
pub use app::{App, AppSnapshot, ProcessorFactory, ServiceRegistry};
pub use broker::{Broker, WorkerProxy, WorkerReply};
pub use config::{Config, ListenerConfig, WorkerType};
pub use error::HiveError;
pub use manager::{ProcessManager, Renewer};
pub use runtime::{Hub, Waiter};
pub use server::{Acceptor, Listeners};
pub use supervisor::{JobEvent, ProcessSpec, Supervisor, WorkerProcess, WorkerStreams};
pub use worker::{EchoProcessor, FrameProcessor, ThriftBinaryProcessor};
