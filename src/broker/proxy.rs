//! Control proxy for a single registered worker.
//!
//! Wraps [`Broker::submit_to`] with the CTRL tag and the JSON control
//! message encoding, one async method per administrative command.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::error::HiveError;
use crate::wire::ipc::{
    decode_ctrl_reply, encode_ctrl_request, status, tag, CtrlReply, CtrlRequest, StackEntry,
};

use super::Broker;

/// Typed control channel to one worker.
#[derive(Debug, Clone)]
pub struct WorkerProxy {
    pid: u32,
    broker: Broker,
}

impl WorkerProxy {
    pub(crate) fn new(pid: u32, broker: Broker) -> Self {
        Self { pid, broker }
    }

    /// Pid of the worker this proxy addresses.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn call(&self, request: &CtrlRequest) -> Result<CtrlReply> {
        let payload = Bytes::from(encode_ctrl_request(request));
        let (_seq, rx) = self.broker.submit_to(self.pid, tag::CTRL, payload).await?;
        let reply = rx.await.map_err(|_| HiveError::WorkerGone(self.pid))?;
        if reply.status != status::OK {
            bail!(
                "control command failed on worker {}: {}",
                self.pid,
                String::from_utf8_lossy(&reply.payload)
            );
        }
        decode_ctrl_reply(&reply.payload)
    }

    async fn call_done(&self, request: &CtrlRequest) -> Result<()> {
        match self.call(request).await? {
            CtrlReply::Done => Ok(()),
            other => bail!("unexpected control reply: {other:?}"),
        }
    }

    /// Set the worker's process title.
    pub async fn change_title(&self, title: &str) -> Result<()> {
        self.call_done(&CtrlRequest::ChangeTitle {
            title: title.to_string(),
        })
        .await
    }

    /// Install the acceptor table on the worker.
    pub async fn register_acceptors(&self, acceptors: BTreeMap<u32, String>) -> Result<()> {
        self.call_done(&CtrlRequest::RegisterAcceptors { acceptors }).await
    }

    /// Mark an acceptor as started on the worker.
    pub async fn start_acceptor(&self, name: &str) -> Result<()> {
        self.call_done(&CtrlRequest::StartAcceptor {
            name: name.to_string(),
        })
        .await
    }

    /// Mark an acceptor as stopped on the worker.
    pub async fn stop_acceptor(&self, name: &str) -> Result<()> {
        self.call_done(&CtrlRequest::StopAcceptor {
            name: name.to_string(),
        })
        .await
    }

    /// Per-method request counters.
    pub async fn get_counters(&self) -> Result<BTreeMap<String, u64>> {
        match self.call(&CtrlRequest::GetCounters).await? {
            CtrlReply::Counters { counters } => Ok(counters),
            other => bail!("unexpected control reply: {other:?}"),
        }
    }

    /// Per-method cumulative latency in microseconds.
    pub async fn get_timers(&self) -> Result<BTreeMap<String, u64>> {
        match self.call(&CtrlRequest::GetTimers).await? {
            CtrlReply::Timers { timers } => Ok(timers),
            other => bail!("unexpected control reply: {other:?}"),
        }
    }

    /// Requests the worker is executing right now.
    pub async fn get_stack(&self) -> Result<Vec<StackEntry>> {
        match self.call(&CtrlRequest::GetStack).await? {
            CtrlReply::Stack { entries } => Ok(entries),
            other => bail!("unexpected control reply: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ipc::{
        decode_ctrl_request, encode_ctrl_reply, encode_reply, RequestDecoder,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    /// Worker stub that answers control commands like the real runloop.
    async fn control_worker(mut incoming: UnixStream, mut outgoing: UnixStream) {
        let mut decoder = RequestDecoder::new(1024 * 1024);
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match incoming.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for frame in decoder.feed(&buf[..n]).unwrap() {
                assert_eq!(frame.tag, tag::CTRL);
                let reply = match decode_ctrl_request(&frame.payload).unwrap() {
                    CtrlRequest::GetCounters => {
                        let mut counters = BTreeMap::new();
                        counters.insert("echo.echoString".to_string(), 3u64);
                        CtrlReply::Counters { counters }
                    }
                    CtrlRequest::GetStack => CtrlReply::Stack { entries: vec![] },
                    _ => CtrlReply::Done,
                };
                let payload = encode_ctrl_reply(&reply);
                outgoing
                    .write_all(&encode_reply(status::OK, frame.seq, &payload))
                    .await
                    .unwrap();
            }
        }
    }

    async fn proxy_with_stub() -> WorkerProxy {
        let broker = Broker::start(4, 1024 * 1024);
        let (incoming_near, incoming_far) = UnixStream::pair().unwrap();
        let (outgoing_near, outgoing_far) = UnixStream::pair().unwrap();
        tokio::spawn(control_worker(incoming_far, outgoing_far));
        broker.register(9, incoming_near, outgoing_near).await;
        broker.get(9)
    }

    #[tokio::test]
    async fn test_change_title_and_acceptor_commands() {
        let proxy = proxy_with_stub().await;
        proxy.change_title("[thrifthive-worker-9]").await.unwrap();

        let mut acceptors = BTreeMap::new();
        acceptors.insert(0, "echo".to_string());
        proxy.register_acceptors(acceptors).await.unwrap();
        proxy.start_acceptor("echo").await.unwrap();
        proxy.stop_acceptor("echo").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_counters() {
        let proxy = proxy_with_stub().await;
        let counters = proxy.get_counters().await.unwrap();
        assert_eq!(counters["echo.echoString"], 3);
    }

    #[tokio::test]
    async fn test_get_stack_empty() {
        let proxy = proxy_with_stub().await;
        assert!(proxy.get_stack().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_to_unknown_worker_fails() {
        let broker = Broker::start(4, 1024 * 1024);
        let proxy = broker.get(42);
        assert!(proxy.change_title("x").await.is_err());
    }
}
