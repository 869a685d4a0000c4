//! The process manager: worker lifecycle from spawn to teardown.
//!
//! # Architecture
//!
//! ```text
//! start():  load spec ──► supervisor ──JobEvent::Spawn──► handshake
//!                                                          │ ok
//!                              broker.register ◄───────────┘
//!                              setup: title, acceptor table, started set
//!                              bootstrapped[pid] = now
//!                              all N ready ──► start waiter fires
//!
//! exit event:  triage log ──► broker.unregister ──► bootstrapped.remove
//!              (supervisor respawns; a fresh Spawn event follows)
//!
//! stop():   supervisor.unload (SIGTERM → SIGKILL) ──► pool idle
//!                                                      │
//!                              stop waiter fires ◄─────┘
//! ```
//!
//! `start` and `stop` run on the main thread: each schedules its async
//! half onto the hub and then blocks on a [`Waiter`] whose timeout comes
//! from configuration. Timeouts and signal-driven aborts escalate to
//! [`HiveError::SystemTerminate`], which the main thread turns into a
//! forced shutdown.

pub mod renewer;

pub use renewer::Renewer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::app::{App, AppSnapshot};
use crate::broker::Broker;
use crate::config::Config;
use crate::constants::IS_WORKER_ENV;
use crate::error::HiveError;
use crate::runtime::{Hub, Waiter};
use crate::server::Listeners;
use crate::supervisor::{JobEvent, ProcessSpec, Supervisor};
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::ipc::ReadyFrame;

/// Session the worker job is grouped under.
pub const SESSION: &str = "thrifthive";

/// Name of the worker job.
pub const WORKER_JOB: &str = "worker";

/// Start and manage the worker pool.
pub struct ProcessManager {
    hub: Arc<Hub>,
    broker: Broker,
    supervisor: Supervisor,
    listeners: Arc<Listeners>,
    config: Config,
    snapshot: AppSnapshot,
    bootstrapped: Mutex<BTreeMap<u32, Instant>>,
    ready_fired: AtomicBool,
    start_waiter: Waiter,
    stop_waiter: Waiter,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("workers", &self.config.workers)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    /// Wire a manager to its collaborators. Nothing is spawned yet.
    pub fn new(
        hub: Arc<Hub>,
        app: &App,
        broker: Broker,
        supervisor: Supervisor,
        listeners: Arc<Listeners>,
    ) -> Arc<Self> {
        let config = app.config.clone();
        let start_timeout = Duration::from_secs(config.process_start_timeout);
        let stop_timeout = Duration::from_secs(config.process_stop_timeout * 2);
        Arc::new(Self {
            hub,
            broker,
            supervisor,
            listeners,
            snapshot: app.snapshot(),
            config,
            bootstrapped: Mutex::new(BTreeMap::new()),
            ready_fired: AtomicBool::new(false),
            start_waiter: Waiter::new(start_timeout),
            stop_waiter: Waiter::new(stop_timeout),
        })
    }

    /// Spawn the pool and block until every worker is bootstrapped.
    pub fn start(self: &Arc<Self>) -> Result<(), HiveError> {
        let this = Arc::clone(self);
        self.hub
            .block_on(async move { this.setup().await })
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?;
        self.start_waiter
            .wait_or_terminate("timeout happened when starting workers")
    }

    /// Unload the pool and block until every worker has exited.
    pub fn stop(self: &Arc<Self>) -> Result<(), HiveError> {
        let this = Arc::clone(self);
        self.hub
            .block_on(async move { this.teardown().await })
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?
            .map_err(|err| HiveError::SystemTerminate(format!("{err:#}")))?;
        self.stop_waiter
            .wait_or_terminate("timeout happened when stopping workers")
    }

    /// Abort any in-progress start/stop wait. Called from signal handlers.
    pub fn abort(&self) {
        self.start_waiter.abort();
        self.stop_waiter.abort();
    }

    /// Whether the whole pool is bootstrapped.
    pub fn is_ready(&self) -> bool {
        self.bootstrapped_count() >= self.config.workers
    }

    fn bootstrapped_count(&self) -> usize {
        self.bootstrapped
            .lock()
            .expect("bootstrapped mutex poisoned")
            .len()
    }

    /// Bootstrapped workers with their registration times, by pid.
    pub fn bootstrapped_snapshot(&self) -> Vec<(u32, Instant)> {
        self.bootstrapped
            .lock()
            .expect("bootstrapped mutex poisoned")
            .iter()
            .map(|(&pid, &at)| (pid, at))
            .collect()
    }

    /// Broker handle, for the admin surface.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Supervisor handle, for the renewer.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    // ── Hub-side lifecycle ────────────────────────────────────────────

    async fn setup(self: Arc<Self>) -> Result<()> {
        let spec = self.process_spec()?;
        self.supervisor.load(spec, SESSION)?;
        let events = self.supervisor.subscribe();
        tokio::spawn(Arc::clone(&self).event_pump(events));
        self.supervisor.start_job(WORKER_JOB)?;
        Ok(())
    }

    async fn teardown(self: Arc<Self>) -> Result<()> {
        self.supervisor.unload(WORKER_JOB, SESSION)?;
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            this.supervisor.wait_idle().await;
            log::info!("[manager] workers stopped");
            this.stop_waiter.done();
        });
        Ok(())
    }

    fn process_spec(&self) -> Result<ProcessSpec> {
        Ok(ProcessSpec {
            name: WORKER_JOB.to_string(),
            command: self.config.worker_command()?,
            args: Vec::new(),
            env: vec![(IS_WORKER_ENV.to_string(), "1".to_string())],
            num_processes: self.config.workers,
            graceful_timeout: Duration::from_secs(self.config.process_stop_timeout),
        })
    }

    async fn event_pump(self: Arc<Self>, mut events: UnboundedReceiver<JobEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Spawn { pid, os_pid } => {
                    tokio::spawn(Arc::clone(&self).handle_spawn(pid, os_pid));
                }
                JobEvent::Exit {
                    pid,
                    os_pid,
                    exit_status,
                    term_signal,
                } => self.handle_exit(pid, os_pid, exit_status, term_signal).await,
            }
        }
    }

    async fn handle_spawn(self: Arc<Self>, pid: u32, os_pid: u32) {
        log::info!("[manager] worker {pid} spawned with os pid {os_pid}");
        let process = match self.supervisor.get_process(pid) {
            Ok(process) => process,
            Err(_) => return, // exited before we got here; exit event follows
        };

        if let Some((stdout, stderr)) = process.take_stdio() {
            tokio::spawn(async move {
                let mut stdout = stdout;
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::stdout()).await;
            });
            tokio::spawn(async move {
                let mut stderr = stderr;
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await;
            });
        }

        let Some(streams) = process.take_streams() else { return };
        let deadline = Duration::from_secs(self.config.process_start_timeout);

        match perform_handshake(
            streams.handshake,
            &self.snapshot,
            deadline,
            self.config.max_frame_size,
        )
        .await
        {
            Ok(ready) => {
                log::debug!("[manager] worker {pid} answered handshake (os pid {})", ready.os_pid);
                if !process.active() {
                    return; // died right after answering; exit event cleans up
                }
                self.broker
                    .register(pid, streams.incoming, streams.outgoing)
                    .await;
                if let Err(err) = self.setup_worker(pid).await {
                    log::error!("[manager] worker {pid} setup failed: {err:#}");
                    self.broker.unregister(pid).await;
                    let _ = self.supervisor.kill(pid, libc::SIGKILL);
                }
            }
            Err(err) => {
                log::error!("[manager] handshake with worker {pid} failed: {err:#}");
                let _ = self.supervisor.kill(pid, libc::SIGKILL);
            }
        }
    }

    /// Post-handshake setup: title, acceptor table, readiness bookkeeping.
    async fn setup_worker(&self, pid: u32) -> Result<()> {
        let proxy = self.broker.get(pid);

        let title = format!(
            "[thrifthive-worker-{pid}] -c {} -k {}",
            self.config.concurrency, self.config.worker_type
        );
        proxy.change_title(&title).await?;

        proxy.register_acceptors(self.listeners.enumerated()).await?;
        for acceptor in self.listeners.iter() {
            if acceptor.auto_start() {
                proxy.start_acceptor(acceptor.name()).await?;
            }
        }

        self.bootstrapped
            .lock()
            .expect("bootstrapped mutex poisoned")
            .insert(pid, Instant::now());
        log::info!("[manager] worker {pid} initialized");

        if self.is_ready() && !self.ready_fired.swap(true, Ordering::SeqCst) {
            log::info!("[manager] workers initialization done");
            self.start_waiter.done();
        }
        Ok(())
    }

    async fn handle_exit(&self, pid: u32, os_pid: u32, exit_status: i32, term_signal: i32) {
        if exit_status != 0 || (term_signal != 0 && term_signal != libc::SIGTERM) {
            log::error!(
                "[manager] worker {pid} (os pid {os_pid}) exited with term signal \
                 {term_signal} and exit status {exit_status}"
            );
        } else {
            log::info!("[manager] worker {pid} exited normally");
        }
        self.broker.unregister(pid).await;
        self.bootstrapped
            .lock()
            .expect("bootstrapped mutex poisoned")
            .remove(&pid);
    }
}

/// Run the master side of the worker handshake.
///
/// Writes the snapshot frame, then waits up to `deadline` for the
/// readiness frame.
pub(crate) async fn perform_handshake(
    mut stream: UnixStream,
    snapshot: &AppSnapshot,
    deadline: Duration,
    max_frame: usize,
) -> Result<ReadyFrame> {
    let payload = serde_json::to_vec(snapshot).context("serialize snapshot")?;
    write_frame(&mut stream, &payload)
        .await
        .context("write snapshot frame")?;

    let reply = tokio::time::timeout(deadline, read_frame(&mut stream, max_frame))
        .await
        .map_err(|_| anyhow!("no handshake response within {deadline:?}"))?
        .context("read readiness frame")?
        .ok_or_else(|| anyhow!("worker closed the handshake stream"))?;

    let ready: ReadyFrame =
        serde_json::from_slice(&reply).context("parse readiness frame")?;
    if !ready.ready {
        return Err(anyhow!("worker reported not ready"));
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerType;
    use tokio::time::timeout;

    fn snapshot() -> AppSnapshot {
        AppSnapshot {
            worker_type: WorkerType::Sync,
            concurrency: 4,
            max_frame_size: 1024 * 1024,
            services: vec!["echo".to_string()],
        }
    }

    #[tokio::test]
    async fn test_handshake_round_trip() {
        let (near, mut far) = UnixStream::pair().unwrap();

        // Worker side: read the snapshot, answer with readiness.
        tokio::spawn(async move {
            let payload = read_frame(&mut far, 1024 * 1024).await.unwrap().unwrap();
            let snapshot: AppSnapshot = serde_json::from_slice(&payload).unwrap();
            assert_eq!(snapshot.services, vec!["echo".to_string()]);

            let ready = ReadyFrame {
                ready: true,
                os_pid: 4321,
            };
            write_frame(&mut far, &serde_json::to_vec(&ready).unwrap())
                .await
                .unwrap();
        });

        let ready = perform_handshake(near, &snapshot(), Duration::from_secs(5), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(ready.os_pid, 4321);
    }

    #[tokio::test]
    async fn test_handshake_times_out_on_silent_worker() {
        let (near, _far) = UnixStream::pair().unwrap();
        let started = Instant::now();
        let err = perform_handshake(near, &snapshot(), Duration::from_millis(100), 1024 * 1024)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("no handshake response"));
    }

    #[tokio::test]
    async fn test_handshake_fails_on_closed_stream() {
        let (near, far) = UnixStream::pair().unwrap();
        drop(far);
        let result = timeout(
            Duration::from_secs(5),
            perform_handshake(near, &snapshot(), Duration::from_secs(5), 1024 * 1024),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_not_ready() {
        let (near, mut far) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let _ = read_frame(&mut far, 1024 * 1024).await;
            let not_ready = ReadyFrame {
                ready: false,
                os_pid: 1,
            };
            let _ = write_frame(&mut far, &serde_json::to_vec(&not_ready).unwrap()).await;
        });

        let err = perform_handshake(near, &snapshot(), Duration::from_secs(5), 1024 * 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }
}
