//! Per-client connection pipeline.
//!
//! Each accepted socket gets two tasks bridged by a FIFO queue:
//!
//! ```text
//! read task:  socket ──decode frame──► broker.submit ──► queue(reply rx)
//! write task: queue ──await reply in submit order──► length-prefix ──► socket
//! ```
//!
//! The read task keeps decoding while earlier requests are still in
//! flight, so clients may pipeline. Workers answer out of order, but the
//! write task resolves the queued receivers strictly in submit order, so
//! the bytes on the wire are the reply frames in submit order.
//!
//! A frame above the size cap or a socket error cancels both tasks and
//! discards pending replies (the broker drops late replies whose
//! receiver is gone). A clean EOF lets the writer drain what is already
//! queued before the connection winds down.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, ReplyReceiver};
use crate::constants::READ_BUFFER_SIZE;
use crate::wire::frame::{encode_frame, FrameDecoder};
use crate::wire::ipc::tag;

/// A reply slot in the per-connection write queue.
enum WriteItem {
    /// Reply still in flight at a worker.
    Pending(ReplyReceiver),
    /// Reply known immediately (backpressure, broker gone).
    Immediate(Bytes),
}

/// Spawn the read/write tasks for one accepted client socket.
pub(crate) fn spawn<S>(conn_id: String, stream: S, broker: Broker, max_frame: usize)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    tokio::spawn(read_loop(
        conn_id.clone(),
        read_half,
        broker,
        max_frame,
        queue_tx,
        cancel.clone(),
    ));
    tokio::spawn(write_loop(conn_id, write_half, queue_rx, cancel));
}

/// Generate a unique connection id using a monotonic counter + random suffix.
pub(crate) fn connection_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("conn:{seq:x}{rand:04x}")
}

async fn read_loop<R>(
    conn_id: String,
    mut reader: R,
    broker: Broker,
    max_frame: usize,
    queue_tx: UnboundedSender<WriteItem>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(max_frame);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    // Clean EOF: stop reading, let queued replies drain.
                    log::debug!("[{conn_id}] peer closed");
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("[{conn_id}] read error: {err}");
                    cancel.cancel();
                    return;
                }
            }
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("[{conn_id}] {err}");
                cancel.cancel();
                return;
            }
        };

        for payload in frames {
            let item = match broker.submit(tag::RPC, payload).await {
                Ok((_submitted, reply_rx)) => WriteItem::Pending(reply_rx),
                Err(err) => {
                    // Rejected synchronously; the legacy empty reply keeps
                    // the connection serviceable.
                    log::warn!("[{conn_id}] submit rejected: {err}");
                    WriteItem::Immediate(Bytes::new())
                }
            };
            if queue_tx.send(item).is_err() {
                return; // writer is gone
            }
        }
    }
}

async fn write_loop<W>(
    conn_id: String,
    mut writer: W,
    mut queue_rx: UnboundedReceiver<WriteItem>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue_rx.recv() => match item {
                Some(item) => item,
                None => break, // read side done and queue drained
            }
        };

        let payload = match item {
            WriteItem::Immediate(payload) => payload,
            WriteItem::Pending(reply_rx) => tokio::select! {
                _ = cancel.cancelled() => break,
                reply = reply_rx => match reply {
                    Ok(reply) => reply.into_client_payload(),
                    // Broker went away mid-request; legacy empty reply.
                    Err(_) => Bytes::new(),
                }
            },
        };

        if let Err(err) = writer.write_all(&encode_frame(&payload)).await {
            log::debug!("[{conn_id}] write error: {err}");
            cancel.cancel();
            break;
        }
    }
}
