//! Process supervision: spawning, monitoring, and respawning workers.
//!
//! # Architecture
//!
//! ```text
//! Supervisor ──load(spec)/start_job──► spawn N children
//!     │                                   │ per child:
//!     │◄──JobEvent::Spawn─────────────────┤ three socketpair streams
//!     │◄──JobEvent::Exit──────────────────┤ (handshake/incoming/outgoing
//!     │                                   │  at child fds 3/4/5), stdout
//!     │   exit while job loaded →         │  and stderr piped
//!     │   respawn after a short delay     │
//!     └──unload: SIGTERM all, SIGKILL after the graceful timeout
//! ```
//!
//! Subscribers receive typed [`JobEvent`]s over an unbounded channel.
//! Process ids are supervisor-internal and monotonic; `os_pid` is the
//! kernel pid. Both appear in events so consumers can address the
//! process (`kill`) and the human (`ps`).
//!
//! Each child inherits the master environment plus whatever its
//! [`ProcessSpec`] adds, with its three IPC streams pre-wired to fixed
//! descriptors. The
//! parent ends are close-on-exec so one worker never inherits another
//! worker's pipes.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};

use crate::constants::{HANDSHAKE_FD, INCOMING_FD, OUTGOING_FD, RESPAWN_DELAY};
use crate::error::HiveError;

/// Description of how to launch a job's worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Job name, unique within the supervisor.
    pub name: String,
    /// Worker executable.
    pub command: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Number of processes kept alive.
    pub num_processes: usize,
    /// SIGTERM → SIGKILL escalation window on unload.
    pub graceful_timeout: Duration,
}

/// Lifecycle events of a job's processes.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A process was spawned (initially or as a respawn).
    Spawn {
        /// Supervisor-internal process id.
        pid: u32,
        /// Kernel pid.
        os_pid: u32,
    },
    /// A process exited.
    Exit {
        /// Supervisor-internal process id.
        pid: u32,
        /// Kernel pid.
        os_pid: u32,
        /// Exit code, 0 when killed by a signal.
        exit_status: i32,
        /// Terminating signal, 0 for a normal exit.
        term_signal: i32,
    },
}

/// The master ends of one worker's IPC streams.
#[derive(Debug)]
pub struct WorkerStreams {
    /// Snapshot out, readiness back. One frame each way.
    pub handshake: UnixStream,
    /// Request frames, master → worker.
    pub incoming: UnixStream,
    /// Reply frames, worker → master.
    pub outgoing: UnixStream,
}

/// Supervisor-side handle to one child process.
pub struct WorkerProcess {
    /// Supervisor-internal process id.
    pub pid: u32,
    /// Kernel pid.
    pub os_pid: u32,
    job: String,
    active: AtomicBool,
    streams: Mutex<Option<WorkerStreams>>,
    stdio: Mutex<Option<(ChildStdout, ChildStderr)>>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("os_pid", &self.os_pid)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Whether the process is still running.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Take ownership of the IPC streams. Returns `None` on the second call.
    pub fn take_streams(&self) -> Option<WorkerStreams> {
        self.streams.lock().expect("streams mutex poisoned").take()
    }

    /// Take ownership of the piped stdout/stderr. Returns `None` on the
    /// second call.
    pub fn take_stdio(&self) -> Option<(ChildStdout, ChildStderr)> {
        self.stdio.lock().expect("stdio mutex poisoned").take()
    }
}

// ─── Supervisor ────────────────────────────────────────────────────────────

// A job's presence in the map is what authorizes respawns; unload
// removes it before signalling the children.
struct Job {
    spec: ProcessSpec,
    session: String,
}

#[derive(Default)]
struct SupState {
    jobs: HashMap<String, Job>,
    processes: HashMap<u32, Arc<WorkerProcess>>,
    subscribers: Vec<mpsc::UnboundedSender<JobEvent>>,
}

struct Inner {
    state: Mutex<SupState>,
    idle: Notify,
    next_pid: AtomicU32,
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SupState::default()),
                idle: Notify::new(),
                next_pid: AtomicU32::new(1),
            }),
        }
    }

    /// Subscribe to job events. Events are fanned out to every receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Store a job description under a session without spawning anything.
    pub fn load(&self, spec: ProcessSpec, session: &str) -> Result<()> {
        if spec.num_processes == 0 {
            bail!("job {:?} has zero processes", spec.name);
        }
        let mut state = self.lock();
        if state.jobs.contains_key(&spec.name) {
            bail!("job {:?} is already loaded", spec.name);
        }
        state.jobs.insert(
            spec.name.clone(),
            Job {
                spec,
                session: session.to_string(),
            },
        );
        Ok(())
    }

    /// Spawn all processes of a loaded job.
    pub fn start_job(&self, name: &str) -> Result<()> {
        let count = {
            let state = self.lock();
            let job = state
                .jobs
                .get(name)
                .with_context(|| format!("job {name:?} is not loaded"))?;
            job.spec.num_processes
        };
        for _ in 0..count {
            self.spawn_one(name)?;
        }
        Ok(())
    }

    /// Stop a job: no more respawns, SIGTERM to all its processes, and
    /// SIGKILL to survivors after the graceful timeout.
    pub fn unload(&self, name: &str, session: &str) -> Result<()> {
        let (graceful_timeout, targets) = {
            let mut state = self.lock();
            let job = state
                .jobs
                .get(name)
                .with_context(|| format!("job {name:?} is not loaded"))?;
            if job.session != session {
                bail!("job {name:?} belongs to session {:?}", job.session);
            }
            let graceful_timeout = job.spec.graceful_timeout;
            let targets: Vec<(u32, u32)> = state
                .processes
                .values()
                .filter(|p| p.job == name)
                .map(|p| (p.pid, p.os_pid))
                .collect();
            state.jobs.remove(name);
            (graceful_timeout, targets)
        };

        for &(pid, os_pid) in &targets {
            log::debug!("[supervisor] SIGTERM to worker {pid} (os pid {os_pid})");
            unsafe { libc::kill(os_pid as libc::pid_t, libc::SIGTERM) };
        }

        // Escalate to SIGKILL for anything still alive after the window.
        let sup = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(graceful_timeout).await;
            for (pid, os_pid) in targets {
                let still_alive = sup.lock().processes.contains_key(&pid);
                if still_alive {
                    log::warn!("[supervisor] worker {pid} survived SIGTERM, sending SIGKILL");
                    unsafe { libc::kill(os_pid as libc::pid_t, libc::SIGKILL) };
                }
            }
        });

        Ok(())
    }

    /// Look up a live process handle.
    pub fn get_process(&self, pid: u32) -> Result<Arc<WorkerProcess>, HiveError> {
        self.lock()
            .processes
            .get(&pid)
            .cloned()
            .ok_or(HiveError::ProcessNotFound(pid))
    }

    /// Deliver a signal to a process by supervisor pid.
    pub fn kill(&self, pid: u32, signal: i32) -> Result<(), HiveError> {
        let process = self.get_process(pid)?;
        let rc = unsafe { libc::kill(process.os_pid as libc::pid_t, signal) };
        if rc != 0 {
            // Raced with the exit path; the monitor task reaps it.
            log::debug!(
                "[supervisor] kill({}, {signal}) failed: {}",
                process.os_pid,
                io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Pids of all live processes, ascending.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Resolve once no processes remain.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking, or a removal between the check
            // and the await would be missed.
            notified.as_mut().enable();
            if self.lock().processes.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupState> {
        self.inner.state.lock().expect("supervisor mutex poisoned")
    }

    fn emit(&self, event: &JobEvent) {
        self.lock()
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Spawn a single process for a job and arm its monitor task.
    fn spawn_one(&self, job_name: &str) -> Result<()> {
        let spec = {
            let state = self.lock();
            let job = state
                .jobs
                .get(job_name)
                .with_context(|| format!("job {job_name:?} is not loaded"))?;
            job.spec.clone()
        };

        let (handshake_near, handshake_far) = stream_pair()?;
        let (incoming_near, incoming_far) = stream_pair()?;
        let (outgoing_near, outgoing_far) = stream_pair()?;

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Wire the child ends onto the fixed stream descriptors. The
        // sources sit above fd 9 (see stream_pair) so the dup2 targets
        // cannot collide with them; the sources themselves are
        // close-on-exec and vanish at exec.
        let wiring: Vec<(RawFd, RawFd)> = vec![
            (handshake_far.as_raw_fd(), HANDSHAKE_FD),
            (incoming_far.as_raw_fd(), INCOMING_FD),
            (outgoing_far.as_raw_fd(), OUTGOING_FD),
        ];
        unsafe {
            command.pre_exec(move || {
                for &(src, dst) in &wiring {
                    if libc::dup2(src, dst) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn worker command {:?}", spec.command))?;
        drop((handshake_far, incoming_far, outgoing_far));

        let os_pid = child
            .id()
            .context("spawned child has no pid")?;
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let process = Arc::new(WorkerProcess {
            pid,
            os_pid,
            job: job_name.to_string(),
            active: AtomicBool::new(true),
            streams: Mutex::new(Some(WorkerStreams {
                handshake: into_tokio_stream(handshake_near)?,
                incoming: into_tokio_stream(incoming_near)?,
                outgoing: into_tokio_stream(outgoing_near)?,
            })),
            stdio: Mutex::new(Some((stdout, stderr))),
        });

        self.lock().processes.insert(pid, Arc::clone(&process));
        self.emit(&JobEvent::Spawn { pid, os_pid });

        // Monitor: reap the exit, emit the event, respawn if the job is
        // still loaded.
        let sup = self.clone();
        let job_name = job_name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let (exit_status, term_signal) = match status {
                Ok(status) => (
                    status.code().unwrap_or(0),
                    status.signal().unwrap_or(0),
                ),
                Err(err) => {
                    log::warn!("[supervisor] wait for worker {pid} failed: {err}");
                    (-1, 0)
                }
            };

            process.active.store(false, Ordering::SeqCst);
            let respawn = {
                let mut state = sup.lock();
                state.processes.remove(&pid);
                state.jobs.contains_key(&job_name)
            };
            sup.inner.idle.notify_waiters();
            sup.emit(&JobEvent::Exit {
                pid,
                os_pid,
                exit_status,
                term_signal,
            });

            if respawn {
                tokio::time::sleep(RESPAWN_DELAY).await;
                if let Err(err) = sup.respawn_if_needed(&job_name) {
                    log::error!("[supervisor] respawn for job {job_name:?} failed: {err}");
                }
            }
        });

        Ok(())
    }

    fn respawn_if_needed(&self, job_name: &str) -> Result<()> {
        let needed = {
            let state = self.lock();
            match state.jobs.get(job_name) {
                Some(job) => {
                    let alive = state.processes.values().filter(|p| p.job == job_name).count();
                    alive < job.spec.num_processes
                }
                None => false,
            }
        };
        if needed {
            self.spawn_one(job_name)?;
        }
        Ok(())
    }
}

// ─── Fd plumbing ───────────────────────────────────────────────────────────

/// Create a stream pair for master/worker IPC.
///
/// The near (master) end is close-on-exec so later children never
/// inherit it. The far (child) end is duplicated above fd 9, also
/// close-on-exec: it survives fork for the `pre_exec` dup2 onto the
/// fixed descriptor, and the duplicate disappears at exec.
fn stream_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("socketpair");
    }
    let near = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let far = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    set_cloexec(near.as_raw_fd())?;
    let far = dup_above(far, 10)?;
    Ok((near, far))
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("set FD_CLOEXEC");
    }
    Ok(())
}

fn dup_above(fd: OwnedFd, min: RawFd) -> Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error()).context("dup stream fd");
    }
    // `fd` drops here, closing the original low descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

fn into_tokio_stream(fd: OwnedFd) -> Result<UnixStream> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream
        .set_nonblocking(true)
        .context("set stream nonblocking")?;
    UnixStream::from_std(stream).context("register stream with the runtime")
}

// ─── Tests ─────────────────────────────────────────────────────────────────
