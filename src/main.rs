//! thrifthive CLI - multi-process container for Thrift RPC services.
//!
//! One binary, two roles: `thrifthive serve` runs the master, and the
//! same executable re-launched with `IS_WORKER=1` (no arguments) runs a
//! worker. The environment marker is checked before argument parsing so
//! the supervisor never has to forward CLI state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use thrifthive::app::{App, ProcessorFactory};
use thrifthive::broker::Broker;
use thrifthive::config::{Config, ListenerConfig};
use thrifthive::constants::IS_WORKER_ENV;
use thrifthive::error::HiveError;
use thrifthive::manager::{ProcessManager, Renewer, SESSION, WORKER_JOB};
use thrifthive::runtime::Hub;
use thrifthive::server::Listeners;
use thrifthive::supervisor::Supervisor;
use thrifthive::worker::{self, EchoProcessor};

#[derive(Parser)]
#[command(name = "thrifthive")]
#[command(version)]
#[command(about = "Multi-process container for Thrift RPC services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind listeners, spawn the worker pool, and serve until a signal
    Serve {
        /// Path to a JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listener as name=host:port (repeatable)
        #[arg(long = "listener")]
        listeners: Vec<String>,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Write "name addr" lines after binding, for port discovery
        #[arg(long)]
        ports_file: Option<PathBuf>,
    },
}

/// Build the service table shared by the master and worker roles.
///
/// Embedders replace this with their own services; the shipped binary
/// carries the echo demo service.
fn build_app(config: Config) -> App {
    let factory: ProcessorFactory = Arc::new(|| Arc::new(EchoProcessor));
    App::new(config).service("echo", factory)
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("THRIFTHIVE_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("warning: cannot open log file {path}: {err}"),
        }
    }
    builder.format_timestamp_secs().init();
}

fn main() -> Result<()> {
    init_logging();

    // Workers are spawned argument-less; the environment decides the role.
    if std::env::var(IS_WORKER_ENV).as_deref() == Ok("1") {
        return run_worker();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            listeners,
            workers,
            ports_file,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            for spec in &listeners {
                config.listeners.push(parse_listener(spec)?);
            }
            run_master(config, ports_file)
        }
    }
}

fn parse_listener(spec: &str) -> Result<ListenerConfig> {
    let (name, addr) = spec
        .split_once('=')
        .with_context(|| format!("listener {spec:?} must be name=host:port"))?;
    Ok(ListenerConfig {
        name: name.to_string(),
        addr: addr
            .parse()
            .with_context(|| format!("listener address {addr:?}"))?,
        started: true,
    })
}

fn run_worker() -> Result<()> {
    let app = build_app(Config::default());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build worker runtime")?;
    runtime.block_on(worker::run(app))
}

fn run_master(config: Config, ports_file: Option<PathBuf>) -> Result<()> {
    if config.listeners.is_empty() {
        bail!("no listeners configured; pass --listener name=host:port");
    }

    let app = build_app(config.clone());
    let hub = Arc::new(Hub::new());
    hub.start()?;

    // Broker and listener sockets live on the hub thread.
    let (broker, listeners) = {
        let config = config.clone();
        hub.block_on(async move {
            let broker = Broker::start(config.concurrency, config.max_frame_size);
            let listeners = Listeners::bind(&config, &broker).await?;
            Ok::<_, anyhow::Error>((broker, Arc::new(listeners)))
        })??
    };

    if let Some(path) = &ports_file {
        listeners.write_ports_file(path)?;
    }

    let supervisor = Supervisor::new();
    let manager = ProcessManager::new(
        Arc::clone(&hub),
        &app,
        broker.clone(),
        supervisor.clone(),
        Arc::clone(&listeners),
    );

    // First signal begins graceful shutdown; a second one aborts any
    // start/stop wait in progress so forced shutdown can proceed.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;
        let mut signals = Signals::new([SIGINT, SIGTERM]).context("install signal handlers")?;
        let shutdown = Arc::clone(&shutdown);
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            for signal in signals.forever() {
                log::info!("[master] received signal {signal}");
                if shutdown.swap(true, Ordering::SeqCst) {
                    manager.abort();
                }
            }
        });
    }

    let result = serve_until_shutdown(&hub, &manager, &listeners, &config, &shutdown);

    // Best-effort cleanup on every path.
    if result.is_err() {
        force_teardown(&hub, &supervisor);
    }
    let cleanup_listeners = Arc::clone(&listeners);
    let cleanup_broker = broker.clone();
    let _ = hub.block_on(async move {
        cleanup_listeners.stop_all();
        cleanup_broker.shutdown().await;
    });
    hub.stop();

    match result {
        Ok(()) => {
            log::info!("[master] exited cleanly");
            Ok(())
        }
        Err(err) => Err(anyhow!(err)),
    }
}

fn serve_until_shutdown(
    hub: &Arc<Hub>,
    manager: &Arc<ProcessManager>,
    listeners: &Arc<Listeners>,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<(), HiveError> {
    manager.start()?;

    let mut renewer = {
        let manager = Arc::clone(manager);
        let ttl = config.worker_ttl;
        hub.block_on(async move { Renewer::start(manager, ttl) })
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?
    };

    {
        let listeners = Arc::clone(listeners);
        hub.block_on(async move { listeners.start_marked() })
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?;
    }

    log::info!("[master] serving with {} workers", config.workers);
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("[master] shutting down");
    let stop_listeners = Arc::clone(listeners);
    let _ = hub.block_on(async move { stop_listeners.stop_all() });
    renewer.stop();
    manager.stop()?;
    Ok(())
}

/// Forced shutdown path: make sure no worker outlives the master.
fn force_teardown(hub: &Arc<Hub>, supervisor: &Supervisor) {
    let supervisor = supervisor.clone();
    let _ = hub.block_on(async move {
        let _ = supervisor.unload(WORKER_JOB, SESSION);
        for pid in supervisor.pids() {
            let _ = supervisor.kill(pid, libc::SIGKILL);
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), supervisor.wait_idle()).await;
    });
}
