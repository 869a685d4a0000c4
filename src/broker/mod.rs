//! Master-side broker: worker registry and request routing.
//!
//! # Architecture
//!
//! ```text
//! Connection ──submit(payload)──► Broker task ──frame──► worker incoming
//!            ◄──oneshot reply───      │
//!                                     │◄──ReplyArrived── reader task per
//!                                     │                  worker outgoing
//! Manager ──register/unregister──────►│
//! Admin   ──keys()/get(pid)──────────►│
//! ```
//!
//! The broker is a single task owning all routing state; components talk
//! to it through a command channel and get results back on oneshots. Per
//! registered worker it keeps an in-flight table (sequence id → pending
//! reply sender) and a pair of I/O tasks: a reader draining the worker's
//! `outgoing` stream and a writer feeding its `incoming` stream.
//!
//! Every reply sender stored in an in-flight table is consumed exactly
//! once: by a matching reply frame, by `unregister` (worker exited), or
//! by broker shutdown. Selection is round-robin over registered workers,
//! skipping workers whose in-flight table has reached the concurrency
//! cap; when every worker is saturated, submissions queue in a bounded
//! FIFO and overflow fails with `Backpressure`.

pub mod proxy;

pub use proxy::WorkerProxy;

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::constants::{PENDING_LIMIT, READ_BUFFER_SIZE};
use crate::error::HiveError;
use crate::wire::ipc::{encode_request, status, ReplyDecoder, ReplyFrame};

/// A reply routed back from a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
    /// One of the [`status`] constants.
    pub status: u8,
    /// Reply frame, or error description for ERR.
    pub payload: Bytes,
}

impl WorkerReply {
    fn worker_gone() -> Self {
        Self {
            status: status::ERR,
            payload: Bytes::from_static(b"worker gone"),
        }
    }

    /// Bytes the client should see: the payload for OK, the legacy empty
    /// frame for anything else.
    pub fn into_client_payload(self) -> Bytes {
        if self.status == status::OK {
            self.payload
        } else {
            Bytes::new()
        }
    }
}

/// Sender half of a pending reply.
pub type ReplySender = oneshot::Sender<WorkerReply>;
/// Receiver half of a pending reply.
pub type ReplyReceiver = oneshot::Receiver<WorkerReply>;

/// Where a submission ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Dispatched immediately: (worker pid, sequence id).
    Dispatched(u32, u64),
    /// Every worker was saturated; queued in the overflow FIFO.
    Queued,
}

// ─── Commands ──────────────────────────────────────────────────────────────

enum BrokerCmd {
    Register {
        pid: u32,
        incoming: UnixStream,
        outgoing: UnixStream,
        done: oneshot::Sender<()>,
    },
    Unregister {
        pid: u32,
        done: oneshot::Sender<()>,
    },
    Submit {
        tag: u8,
        payload: Bytes,
        reply: ReplySender,
        resp: oneshot::Sender<Result<Submitted, HiveError>>,
    },
    SubmitTo {
        pid: u32,
        tag: u8,
        payload: Bytes,
        reply: ReplySender,
        resp: oneshot::Sender<Result<u64, HiveError>>,
    },
    ReplyArrived {
        pid: u32,
        frame: ReplyFrame,
    },
    Keys {
        resp: oneshot::Sender<Vec<u32>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ─── Worker entry ──────────────────────────────────────────────────────────

struct WorkerEntry {
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    next_seq: u64,
    in_flight: HashMap<u64, ReplySender>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WorkerEntry {
    fn dispatch(&mut self, tag: u8, payload: &[u8], reply: ReplySender) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq, reply);
        let _ = self.incoming_tx.send(encode_request(tag, seq, payload));
        seq
    }

    fn flush(&mut self) {
        for (_, tx) in self.in_flight.drain() {
            let _ = tx.send(WorkerReply::worker_gone());
        }
    }
}

// ─── Broker handle ─────────────────────────────────────────────────────────

/// Handle to the broker task. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    cmd_tx: mpsc::UnboundedSender<BrokerCmd>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Spawn the broker task on the current runtime.
    pub fn start(concurrency: usize, max_frame: usize) -> Self {
        Self::with_pending_limit(concurrency, max_frame, PENDING_LIMIT)
    }

    /// Spawn the broker task with an explicit overflow queue bound.
    pub fn with_pending_limit(concurrency: usize, max_frame: usize, pending_limit: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = BrokerState {
            workers: BTreeMap::new(),
            pending: VecDeque::new(),
            last_pid: None,
            concurrency,
            max_frame,
            pending_limit,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(run(state, cmd_rx));
        Self { cmd_tx }
    }

    /// Register a worker's IPC streams and start routing to it.
    pub async fn register(&self, pid: u32, incoming: UnixStream, outgoing: UnixStream) {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(BrokerCmd::Register {
            pid,
            incoming,
            outgoing,
            done: done_tx,
        });
        let _ = done_rx.await;
    }

    /// Remove a worker. Pending replies complete with the worker-gone
    /// error; the worker's `incoming` writer is closed.
    pub async fn unregister(&self, pid: u32) {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(BrokerCmd::Unregister { pid, done: done_tx });
        let _ = done_rx.await;
    }

    /// Submit a request under the selection policy.
    ///
    /// Returns the submission receipt and the reply receiver. The
    /// receiver resolves exactly once.
    pub async fn submit(
        &self,
        tag: u8,
        payload: Bytes,
    ) -> Result<(Submitted, ReplyReceiver), HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCmd::Submit {
                tag,
                payload,
                reply: reply_tx,
                resp: resp_tx,
            })
            .map_err(|_| HiveError::BrokerClosed)?;
        let submitted = resp_rx.await.map_err(|_| HiveError::BrokerClosed)??;
        Ok((submitted, reply_rx))
    }

    /// Submit a request to one specific worker, bypassing the selection
    /// policy. Used for control commands.
    pub async fn submit_to(
        &self,
        pid: u32,
        tag: u8,
        payload: Bytes,
    ) -> Result<(u64, ReplyReceiver), HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCmd::SubmitTo {
                pid,
                tag,
                payload,
                reply: reply_tx,
                resp: resp_tx,
            })
            .map_err(|_| HiveError::BrokerClosed)?;
        let seq = resp_rx.await.map_err(|_| HiveError::BrokerClosed)??;
        Ok((seq, reply_rx))
    }

    /// Currently registered worker pids, ascending.
    pub async fn keys(&self) -> Vec<u32> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(BrokerCmd::Keys { resp: resp_tx }).is_err() {
            return Vec::new();
        }
        resp_rx.await.unwrap_or_default()
    }

    /// Control proxy for one worker.
    pub fn get(&self, pid: u32) -> WorkerProxy {
        WorkerProxy::new(pid, self.clone())
    }

    /// Tear the broker down, flushing every pending reply.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(BrokerCmd::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

// ─── Broker task ───────────────────────────────────────────────────────────

struct BrokerState {
    workers: BTreeMap<u32, WorkerEntry>,
    pending: VecDeque<(u8, Bytes, ReplySender)>,
    last_pid: Option<u32>,
    concurrency: usize,
    max_frame: usize,
    pending_limit: usize,
    cmd_tx: mpsc::UnboundedSender<BrokerCmd>,
}

impl BrokerState {
    /// Round-robin pick of the next worker with in-flight capacity.
    fn pick_worker(&mut self) -> Option<u32> {
        let keys: Vec<u32> = self.workers.keys().copied().collect();
        if keys.is_empty() {
            return None;
        }
        let start = match self.last_pid {
            Some(last) => keys.iter().position(|&pid| pid > last).unwrap_or(0),
            None => 0,
        };
        for i in 0..keys.len() {
            let pid = keys[(start + i) % keys.len()];
            let entry = &self.workers[&pid];
            if entry.in_flight.len() < self.concurrency {
                self.last_pid = Some(pid);
                return Some(pid);
            }
        }
        None
    }

    fn submit(&mut self, tag: u8, payload: Bytes, reply: ReplySender) -> Result<Submitted, HiveError> {
        if let Some(pid) = self.pick_worker() {
            let entry = self.workers.get_mut(&pid).expect("picked worker exists");
            let seq = entry.dispatch(tag, &payload, reply);
            return Ok(Submitted::Dispatched(pid, seq));
        }
        if self.pending.len() >= self.pending_limit {
            return Err(HiveError::Backpressure);
        }
        self.pending.push_back((tag, payload, reply));
        Ok(Submitted::Queued)
    }

    /// Serve queued submissions while any worker has capacity.
    fn drain_pending(&mut self) {
        while !self.pending.is_empty() {
            let Some(pid) = self.pick_worker() else { break };
            let (tag, payload, reply) = self.pending.pop_front().expect("queue not empty");
            let entry = self.workers.get_mut(&pid).expect("picked worker exists");
            entry.dispatch(tag, &payload, reply);
        }
    }

    fn remove_worker(&mut self, pid: u32) {
        if let Some(mut entry) = self.workers.remove(&pid) {
            entry.flush();
            entry.reader.abort();
            // Dropping the sender ends the writer, closing `incoming`.
            entry.writer.abort();
            log::debug!("[broker] worker {pid} unregistered");
        }
    }
}

async fn run(mut state: BrokerState, mut cmd_rx: mpsc::UnboundedReceiver<BrokerCmd>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            BrokerCmd::Register {
                pid,
                incoming,
                outgoing,
                done,
            } => {
                let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
                let reader = tokio::spawn(reader_loop(
                    pid,
                    outgoing,
                    state.cmd_tx.clone(),
                    state.max_frame,
                ));
                let writer = tokio::spawn(writer_loop(pid, incoming, incoming_rx));
                state.workers.insert(
                    pid,
                    WorkerEntry {
                        incoming_tx,
                        next_seq: 1,
                        in_flight: HashMap::new(),
                        reader,
                        writer,
                    },
                );
                log::debug!("[broker] worker {pid} registered");
                state.drain_pending();
                let _ = done.send(());
            }

            BrokerCmd::Unregister { pid, done } => {
                state.remove_worker(pid);
                let _ = done.send(());
            }

            BrokerCmd::Submit {
                tag,
                payload,
                reply,
                resp,
            } => {
                let _ = resp.send(state.submit(tag, payload, reply));
            }

            BrokerCmd::SubmitTo {
                pid,
                tag,
                payload,
                reply,
                resp,
            } => {
                let result = match state.workers.get_mut(&pid) {
                    Some(entry) => Ok(entry.dispatch(tag, &payload, reply)),
                    None => Err(HiveError::WorkerGone(pid)),
                };
                let _ = resp.send(result);
            }

            BrokerCmd::ReplyArrived { pid, frame } => {
                match state
                    .workers
                    .get_mut(&pid)
                    .and_then(|entry| entry.in_flight.remove(&frame.seq))
                {
                    Some(tx) => {
                        // The receiver may be gone (connection closed);
                        // the reply is simply dropped then.
                        let _ = tx.send(WorkerReply {
                            status: frame.status,
                            payload: frame.payload,
                        });
                    }
                    None => {
                        log::debug!(
                            "[broker] dropping reply seq {} from worker {pid}: no in-flight entry",
                            frame.seq
                        );
                    }
                }
                state.drain_pending();
            }

            BrokerCmd::Keys { resp } => {
                let _ = resp.send(state.workers.keys().copied().collect());
            }

            BrokerCmd::Shutdown { done } => {
                let pids: Vec<u32> = state.workers.keys().copied().collect();
                for pid in pids {
                    state.remove_worker(pid);
                }
                for (_, _, tx) in state.pending.drain(..) {
                    let _ = tx.send(WorkerReply::worker_gone());
                }
                let _ = done.send(());
                break;
            }
        }
    }
}

/// Drain a worker's `outgoing` stream, routing reply frames back to the
/// broker task. Ends on EOF or a decode error; the exit event is what
/// unregisters the worker.
async fn reader_loop(
    pid: u32,
    mut outgoing: UnixStream,
    cmd_tx: mpsc::UnboundedSender<BrokerCmd>,
    max_frame: usize,
) {
    let mut decoder = ReplyDecoder::new(max_frame);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match outgoing.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        if cmd_tx.send(BrokerCmd::ReplyArrived { pid, frame }).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    log::warn!("[broker] reply decode error from worker {pid}: {err}");
                    break;
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::debug!("[broker] read error from worker {pid}: {err}");
                break;
            }
        }
    }
}

/// Feed a worker's `incoming` stream from its frame queue.
async fn writer_loop(
    pid: u32,
    mut incoming: UnixStream,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(err) = incoming.write_all(&frame).await {
            log::debug!("[broker] write error to worker {pid}: {err}");
            break;
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ipc::{encode_reply, tag, RequestDecoder};
    use std::time::Duration;

    /// Spawn a scripted worker on the far ends of a registered stream
    /// pair. The closure maps each request to `Some(reply frames)` or
    /// `None` to stay silent.
    fn spawn_fake_worker<F>(
        incoming_far: UnixStream,
        outgoing_far: UnixStream,
        mut script: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(crate::wire::ipc::RequestFrame) -> Option<Vec<Vec<u8>>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut incoming = incoming_far;
            let mut outgoing = outgoing_far;
            let mut decoder = RequestDecoder::new(1024 * 1024);
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match incoming.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for frame in decoder.feed(&buf[..n]).unwrap() {
                    if let Some(replies) = script(frame) {
                        for reply in replies {
                            outgoing.write_all(&reply).await.unwrap();
                        }
                    }
                }
            }
        })
    }

    async fn register_worker<F>(broker: &Broker, pid: u32, script: F)
    where
        F: FnMut(crate::wire::ipc::RequestFrame) -> Option<Vec<Vec<u8>>> + Send + 'static,
    {
        let (incoming_near, incoming_far) = UnixStream::pair().unwrap();
        let (outgoing_near, outgoing_far) = UnixStream::pair().unwrap();
        spawn_fake_worker(incoming_far, outgoing_far, script);
        broker.register(pid, incoming_near, outgoing_near).await;
    }

    fn echo_script() -> impl FnMut(crate::wire::ipc::RequestFrame) -> Option<Vec<Vec<u8>>> {
        |req| Some(vec![encode_reply(status::OK, req.seq, &req.payload)])
    }

    #[tokio::test]
    async fn test_reply_routing_round_trip() {
        let broker = Broker::start(4, 1024 * 1024);
        register_worker(&broker, 1, echo_script()).await;

        let (submitted, rx) = broker
            .submit(tag::RPC, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(matches!(submitted, Submitted::Dispatched(1, 1)));

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, status::OK);
        assert_eq!(&reply.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_sequence_ids_are_monotonic_per_worker() {
        let broker = Broker::start(8, 1024 * 1024);
        register_worker(&broker, 1, echo_script()).await;

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let (submitted, rx) = broker
                .submit(tag::RPC, Bytes::from_static(b"x"))
                .await
                .unwrap();
            let Submitted::Dispatched(_, seq) = submitted else {
                panic!("expected immediate dispatch");
            };
            seqs.push(seq);
            rx.await.unwrap();
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_round_robin_alternates_workers() {
        let broker = Broker::start(8, 1024 * 1024);
        register_worker(&broker, 1, echo_script()).await;
        register_worker(&broker, 2, echo_script()).await;

        let mut picked = Vec::new();
        for _ in 0..4 {
            let (submitted, rx) = broker
                .submit(tag::RPC, Bytes::from_static(b"x"))
                .await
                .unwrap();
            let Submitted::Dispatched(pid, _) = submitted else {
                panic!("expected immediate dispatch");
            };
            picked.push(pid);
            rx.await.unwrap();
        }
        assert_eq!(picked, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_saturated_workers_queue_then_backpressure() {
        let broker = Broker::with_pending_limit(1, 1024 * 1024, 2);
        // Silent worker: requests go in-flight and never complete.
        register_worker(&broker, 1, |_req| None).await;

        let (first, _rx1) = broker
            .submit(tag::RPC, Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert!(matches!(first, Submitted::Dispatched(1, 1)));

        let (second, _rx2) = broker
            .submit(tag::RPC, Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_eq!(second, Submitted::Queued);
        let (third, _rx3) = broker
            .submit(tag::RPC, Bytes::from_static(b"c"))
            .await
            .unwrap();
        assert_eq!(third, Submitted::Queued);

        let err = broker
            .submit(tag::RPC, Bytes::from_static(b"d"))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Backpressure));
    }

    #[tokio::test]
    async fn test_unregister_flushes_pending_with_worker_gone() {
        let broker = Broker::start(4, 1024 * 1024);
        register_worker(&broker, 1, |_req| None).await;

        let (_, rx) = broker
            .submit(tag::RPC, Bytes::from_static(b"never answered"))
            .await
            .unwrap();
        broker.unregister(1).await;

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, status::ERR);
        assert!(reply.into_client_payload().is_empty());
    }

    #[tokio::test]
    async fn test_submission_before_any_worker_is_queued() {
        let broker = Broker::start(4, 1024 * 1024);

        let (submitted, rx) = broker
            .submit(tag::RPC, Bytes::from_static(b"early"))
            .await
            .unwrap();
        assert_eq!(submitted, Submitted::Queued);

        register_worker(&broker, 7, echo_script()).await;
        let reply = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply.payload[..], b"early");
    }

    #[tokio::test]
    async fn test_unknown_sequence_id_is_dropped() {
        let broker = Broker::start(4, 1024 * 1024);
        // Replies once with a bogus sequence id, then echoes correctly.
        register_worker(&broker, 1, |req| {
            Some(vec![
                encode_reply(status::OK, 9999, b"bogus"),
                encode_reply(status::OK, req.seq, &req.payload),
            ])
        })
        .await;

        let (_, rx) = broker
            .submit(tag::RPC, Bytes::from_static(b"real"))
            .await
            .unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(&reply.payload[..], b"real");
    }

    #[tokio::test]
    async fn test_keys_tracks_registration() {
        let broker = Broker::start(4, 1024 * 1024);
        assert!(broker.keys().await.is_empty());

        register_worker(&broker, 2, echo_script()).await;
        register_worker(&broker, 1, echo_script()).await;
        assert_eq!(broker.keys().await, vec![1, 2]);

        broker.unregister(1).await;
        assert_eq!(broker.keys().await, vec![2]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_submissions() {
        let broker = Broker::start(4, 1024 * 1024);
        let (_, rx) = broker
            .submit(tag::RPC, Bytes::from_static(b"queued"))
            .await
            .unwrap();
        broker.shutdown().await;

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, status::ERR);
        assert!(broker.submit(tag::RPC, Bytes::new()).await.is_err());
    }
}
