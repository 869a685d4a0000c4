//! Worker-side runloop.
//!
//! # Architecture
//!
//! ```text
//! fd 3 handshake:  read snapshot frame ──► build processors ──► write READY
//! fd 4 incoming:   RPC  ──► processor ──► OK reply (empty on handler error)
//!                  CTRL ──► control handler ──► OK/ERR reply
//! fd 5 outgoing:   single writer task serializes all reply frames
//! ```
//!
//! The worker inherits its three IPC streams on fixed descriptors (see
//! the supervisor), reads exactly one snapshot frame, reconstructs its
//! processors from the factories compiled into the binary, and answers
//! with a readiness frame. Only then does the master register it with
//! the broker.
//!
//! Request execution follows the configured worker type: `sync` runs
//! requests inline in arrival order; `concurrent` runs each request on a
//! blocking task, bounded by the concurrency cap. A handler error is
//! logged and answered with the legacy empty OK reply. The loop ends
//! when the master closes the `incoming` stream.

pub mod processor;

pub use processor::{EchoProcessor, FrameProcessor, ThriftBinaryProcessor};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Semaphore};

use crate::app::{App, AppSnapshot};
use crate::config::WorkerType;
use crate::constants::{HANDSHAKE_FD, INCOMING_FD, OUTGOING_FD, READ_BUFFER_SIZE};
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::ipc::{
    decode_ctrl_request, encode_ctrl_reply, encode_reply, status, tag, CtrlReply, CtrlRequest,
    ReadyFrame, RequestDecoder, RequestFrame, StackEntry,
};

/// Entry point for a process launched with `IS_WORKER=1`.
///
/// Adopts the inherited stream descriptors, performs the handshake, and
/// serves requests until the master closes the channel.
pub async fn run(app: App) -> Result<()> {
    let mut handshake = stream_from_fd(HANDSHAKE_FD).context("adopt handshake stream")?;
    let incoming = stream_from_fd(INCOMING_FD).context("adopt incoming stream")?;
    let outgoing = stream_from_fd(OUTGOING_FD).context("adopt outgoing stream")?;

    let (state, snapshot) = perform_handshake(&app, &mut handshake).await?;
    log::info!(
        "[worker] ready: service {:?}, {} mode, concurrency {}",
        state.service,
        snapshot.worker_type,
        snapshot.concurrency
    );

    serve(state, snapshot, incoming, outgoing).await
}

// ─── Worker state ──────────────────────────────────────────────────────────

struct AcceptorTable {
    names: BTreeMap<u32, String>,
    started: BTreeSet<String>,
}

/// Shared state of one worker process.
impl std::fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerState")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

pub(crate) struct WorkerState {
    service: String,
    processor: Arc<dyn FrameProcessor>,
    counters: Mutex<BTreeMap<String, u64>>,
    timers: Mutex<BTreeMap<String, u64>>,
    /// In-flight requests: sequence id → (method label, start time).
    stack: Mutex<HashMap<u64, (String, Instant)>>,
    acceptors: Mutex<AcceptorTable>,
}

impl WorkerState {
    fn build(app: &App, snapshot: &AppSnapshot) -> Result<Arc<Self>> {
        // Every service the master announced must be buildable here;
        // master and worker run the same binary, so a miss means a
        // version or deployment skew worth failing loudly on.
        for name in &snapshot.services {
            if app.services.build(name).is_none() {
                bail!("service {name:?} is not registered in this binary");
            }
        }
        let (service, processor) = app.services.dispatcher()?;
        Ok(Arc::new(Self {
            service,
            processor,
            counters: Mutex::new(BTreeMap::new()),
            timers: Mutex::new(BTreeMap::new()),
            stack: Mutex::new(HashMap::new()),
            acceptors: Mutex::new(AcceptorTable {
                names: BTreeMap::new(),
                started: BTreeSet::new(),
            }),
        }))
    }
}

/// Worker side of the handshake: snapshot in, readiness out.
pub(crate) async fn perform_handshake(
    app: &App,
    handshake: &mut UnixStream,
) -> Result<(Arc<WorkerState>, AppSnapshot)> {
    let payload = read_frame(handshake, app.config.max_frame_size)
        .await
        .context("read snapshot frame")?
        .ok_or_else(|| anyhow!("master closed the handshake stream"))?;
    let snapshot: AppSnapshot =
        serde_json::from_slice(&payload).context("parse snapshot frame")?;

    let state = WorkerState::build(app, &snapshot)?;

    let ready = ReadyFrame {
        ready: true,
        os_pid: std::process::id(),
    };
    write_frame(handshake, &serde_json::to_vec(&ready)?)
        .await
        .context("write readiness frame")?;

    Ok((state, snapshot))
}

// ─── Request loop ──────────────────────────────────────────────────────────

pub(crate) async fn serve(
    state: Arc<WorkerState>,
    snapshot: AppSnapshot,
    mut incoming: UnixStream,
    outgoing: UnixStream,
) -> Result<()> {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(writer_loop(outgoing, reply_rx));
    let permits = Arc::new(Semaphore::new(snapshot.concurrency.max(1)));

    let mut decoder = RequestDecoder::new(snapshot.max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match incoming.read(&mut buf).await {
            Ok(0) => break, // master closed the channel; shut down
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("[worker] read error on incoming stream: {err}");
                break;
            }
        };

        for frame in decoder.feed(&buf[..n])? {
            match frame.tag {
                tag::CTRL => {
                    let reply = handle_ctrl(&state, &frame);
                    let _ = reply_tx.send(reply);
                }
                tag::RPC => match snapshot.worker_type {
                    WorkerType::Sync => {
                        let reply = execute(&state, frame.seq, &frame.payload);
                        let _ = reply_tx.send(reply);
                    }
                    WorkerType::Concurrent => {
                        let permit = Arc::clone(&permits)
                            .acquire_owned()
                            .await
                            .context("concurrency semaphore closed")?;
                        let state = Arc::clone(&state);
                        let reply_tx = reply_tx.clone();
                        tokio::task::spawn_blocking(move || {
                            let reply = execute(&state, frame.seq, &frame.payload);
                            let _ = reply_tx.send(reply);
                            drop(permit);
                        });
                    }
                },
                _ => unreachable!("decoder rejects unknown tags"),
            }
        }
    }

    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}

async fn writer_loop(mut outgoing: UnixStream, mut reply_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = reply_rx.recv().await {
        if let Err(err) = outgoing.write_all(&frame).await {
            log::warn!("[worker] write error on outgoing stream: {err}");
            break;
        }
    }
}

/// Run one RPC through the processor and encode the reply frame.
fn execute(state: &WorkerState, seq: u64, payload: &[u8]) -> Vec<u8> {
    let label = format!(
        "{}.{}",
        state.service,
        state
            .processor
            .peek_method(payload)
            .as_deref()
            .unwrap_or("unknown")
    );
    state
        .stack
        .lock()
        .expect("stack mutex poisoned")
        .insert(seq, (label.clone(), Instant::now()));
    let started = Instant::now();
    let result = state.processor.process(payload);
    let elapsed = started.elapsed();
    state
        .stack
        .lock()
        .expect("stack mutex poisoned")
        .remove(&seq);

    match result {
        Ok(reply) => {
            *state
                .counters
                .lock()
                .expect("counters mutex poisoned")
                .entry(label.clone())
                .or_insert(0) += 1;
            *state
                .timers
                .lock()
                .expect("timers mutex poisoned")
                .entry(label)
                .or_insert(0) += elapsed.as_micros() as u64;
            encode_reply(status::OK, seq, &reply)
        }
        Err(err) => {
            // Legacy convention: the caller sees an empty OK reply.
            log::warn!("[worker] handler error: {err:#}");
            *state
                .counters
                .lock()
                .expect("counters mutex poisoned")
                .entry(format!("{}.error", state.service))
                .or_insert(0) += 1;
            encode_reply(status::OK, seq, b"")
        }
    }
}

/// Apply one control command and encode its reply frame.
fn handle_ctrl(state: &WorkerState, frame: &RequestFrame) -> Vec<u8> {
    let request = match decode_ctrl_request(&frame.payload) {
        Ok(request) => request,
        Err(err) => {
            return encode_reply(status::ERR, frame.seq, err.to_string().as_bytes());
        }
    };

    let reply = match request {
        CtrlRequest::ChangeTitle { title } => {
            proctitle::set_title(&title);
            CtrlReply::Done
        }
        CtrlRequest::RegisterAcceptors { acceptors } => {
            let mut table = state.acceptors.lock().expect("acceptors mutex poisoned");
            table.names = acceptors;
            table.started.clear();
            CtrlReply::Done
        }
        CtrlRequest::StartAcceptor { name } => {
            let mut table = state.acceptors.lock().expect("acceptors mutex poisoned");
            if !table.names.values().any(|n| n == &name) {
                return encode_reply(
                    status::ERR,
                    frame.seq,
                    format!("unknown acceptor {name:?}").as_bytes(),
                );
            }
            table.started.insert(name);
            CtrlReply::Done
        }
        CtrlRequest::StopAcceptor { name } => {
            let mut table = state.acceptors.lock().expect("acceptors mutex poisoned");
            if !table.names.values().any(|n| n == &name) {
                return encode_reply(
                    status::ERR,
                    frame.seq,
                    format!("unknown acceptor {name:?}").as_bytes(),
                );
            }
            table.started.remove(&name);
            CtrlReply::Done
        }
        CtrlRequest::GetCounters => CtrlReply::Counters {
            counters: state
                .counters
                .lock()
                .expect("counters mutex poisoned")
                .clone(),
        },
        CtrlRequest::GetTimers => CtrlReply::Timers {
            timers: state.timers.lock().expect("timers mutex poisoned").clone(),
        },
        CtrlRequest::GetStack => CtrlReply::Stack {
            entries: state
                .stack
                .lock()
                .expect("stack mutex poisoned")
                .iter()
                .map(|(&seq, (method, started))| StackEntry {
                    seq,
                    method: method.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
                .collect(),
        },
    };

    encode_reply(status::OK, frame.seq, &encode_ctrl_reply(&reply))
}

fn stream_from_fd(fd: RawFd) -> Result<UnixStream> {
    // Safety: the supervisor placed these descriptors before exec and
    // nothing else in this process owns them.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true).context("set nonblocking")?;
    UnixStream::from_std(stream).context("register with the runtime")
}

// ─── Tests ─────────────────────────────────────────────────────────────────
