//! Worker IPC protocol: frame layouts and control messages.
//!
//! Wire format on the `incoming` stream (master → worker):
//!
//! ```text
//! [u32 BE length] [u8 tag] [u64 BE sequence id] [payload]
//! ```
//!
//! and on the `outgoing` stream (worker → master):
//!
//! ```text
//! [u32 BE length] [u8 status] [u64 BE sequence id] [payload]
//! ```
//!
//! Tags: `0x01` RPC (payload is a raw Thrift frame), `0x02` CTRL (payload
//! is a JSON-encoded [`CtrlRequest`]). Statuses: `0x00` OK, `0x01` ERR
//! (payload is a UTF-8 error description). An empty OK payload is the
//! legacy signal that the handler raised.
//!
//! Handshake frames carry no tag or sequence id; they are bare
//! length-prefixed payloads (see [`crate::wire::frame`]).
//!
//! Replies may arrive out of order; correlation is strictly by sequence id.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::frame::FrameDecoder;

/// Header bytes after the length prefix: tag/status plus sequence id.
const BODY_HEADER: usize = 1 + 8;

/// Request tag constants (master → worker).
pub mod tag {
    /// Raw Thrift frame for the worker's processor.
    pub const RPC: u8 = 0x01;
    /// JSON-encoded control command.
    pub const CTRL: u8 = 0x02;
}

/// Reply status constants (worker → master).
pub mod status {
    /// Successful reply; payload is the reply frame (possibly empty).
    pub const OK: u8 = 0x00;
    /// Failed reply; payload is a UTF-8 error description.
    pub const ERR: u8 = 0x01;
}

// ─── Frames ────────────────────────────────────────────────────────────────

/// A decoded request frame from the `incoming` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// One of the [`tag`] constants.
    pub tag: u8,
    /// Sequence id, unique within this worker's channel.
    pub seq: u64,
    /// RPC or control payload.
    pub payload: Bytes,
}

/// A decoded reply frame from the `outgoing` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    /// One of the [`status`] constants.
    pub status: u8,
    /// Sequence id copied from the request.
    pub seq: u64,
    /// Reply frame or error description.
    pub payload: Bytes,
}

/// Encode a request frame for the `incoming` stream.
pub fn encode_request(tag: u8, seq: u64, payload: &[u8]) -> Vec<u8> {
    encode_body(tag, seq, payload)
}

/// Encode a reply frame for the `outgoing` stream.
pub fn encode_reply(status: u8, seq: u64, payload: &[u8]) -> Vec<u8> {
    encode_body(status, seq, payload)
}

fn encode_body(head: u8, seq: u64, payload: &[u8]) -> Vec<u8> {
    let length = (BODY_HEADER + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + BODY_HEADER + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(head);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn split_body(mut body: Bytes) -> Result<(u8, u64, Bytes)> {
    if body.len() < BODY_HEADER {
        bail!("IPC frame body too short: {} bytes", body.len());
    }
    let head = body[0];
    let seq = u64::from_be_bytes([
        body[1], body[2], body[3], body[4], body[5], body[6], body[7], body[8],
    ]);
    let payload = body.split_off(BODY_HEADER);
    Ok((head, seq, payload))
}

/// Incremental decoder for `incoming` request frames.
#[derive(Debug)]
pub struct RequestDecoder {
    inner: FrameDecoder,
}

impl RequestDecoder {
    /// Create a decoder with the given frame size cap.
    pub fn new(max_frame: usize) -> Self {
        Self {
            inner: FrameDecoder::new(max_frame),
        }
    }

    /// Feed bytes and extract all complete request frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RequestFrame>> {
        self.inner
            .feed(bytes)?
            .into_iter()
            .map(|body| {
                let (tag, seq, payload) = split_body(body)?;
                if tag != tag::RPC && tag != tag::CTRL {
                    bail!("unknown request tag: 0x{tag:02x}");
                }
                Ok(RequestFrame { tag, seq, payload })
            })
            .collect()
    }
}

/// Incremental decoder for `outgoing` reply frames.
#[derive(Debug)]
pub struct ReplyDecoder {
    inner: FrameDecoder,
}

impl ReplyDecoder {
    /// Create a decoder with the given frame size cap.
    pub fn new(max_frame: usize) -> Self {
        Self {
            inner: FrameDecoder::new(max_frame),
        }
    }

    /// Feed bytes and extract all complete reply frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ReplyFrame>> {
        self.inner
            .feed(bytes)?
            .into_iter()
            .map(|body| {
                let (status, seq, payload) = split_body(body)?;
                if status != status::OK && status != status::ERR {
                    bail!("unknown reply status: 0x{status:02x}");
                }
                Ok(ReplyFrame {
                    status,
                    seq,
                    payload,
                })
            })
            .collect()
    }
}

// ─── Control messages ──────────────────────────────────────────────────────

/// Control commands sent to a worker in CTRL frames (JSON payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CtrlRequest {
    /// Set the worker's process title (what `ps` shows).
    ChangeTitle {
        /// New process title.
        title: String,
    },

    /// Install the acceptor table: listener index → listener name.
    RegisterAcceptors {
        /// Enumerated listener names, as bound on the master.
        acceptors: BTreeMap<u32, String>,
    },

    /// Mark a registered acceptor as started.
    StartAcceptor {
        /// Listener name.
        name: String,
    },

    /// Mark a registered acceptor as stopped.
    StopAcceptor {
        /// Listener name.
        name: String,
    },

    /// Fetch per-method request counters.
    GetCounters,

    /// Fetch per-method cumulative latency, in microseconds.
    GetTimers,

    /// Fetch the currently executing requests.
    GetStack,
}

/// A currently executing request, as reported by `GetStack`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackEntry {
    /// Sequence id of the request.
    pub seq: u64,
    /// `service.method` label, or `service.unknown`.
    pub method: String,
    /// Milliseconds since processing started.
    pub elapsed_ms: u64,
}

/// Readiness marker a worker writes back on its handshake stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyFrame {
    /// Always true; a worker that cannot serve exits instead.
    pub ready: bool,
    /// Kernel pid of the worker, for log correlation.
    pub os_pid: u32,
}

/// Replies to control commands (JSON payload of an OK reply frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CtrlReply {
    /// Command applied; nothing to report.
    Done,

    /// Reply to `GetCounters`.
    Counters {
        /// `service.method` → number of requests processed.
        counters: BTreeMap<String, u64>,
    },

    /// Reply to `GetTimers`.
    Timers {
        /// `service.method` → cumulative processing time in microseconds.
        timers: BTreeMap<String, u64>,
    },

    /// Reply to `GetStack`.
    Stack {
        /// Requests currently being processed.
        entries: Vec<StackEntry>,
    },
}

/// Encode a control request into a CTRL frame payload.
pub fn encode_ctrl_request(req: &CtrlRequest) -> Vec<u8> {
    serde_json::to_vec(req).expect("control request serialization cannot fail")
}

/// Encode a control reply into an OK frame payload.
pub fn encode_ctrl_reply(reply: &CtrlReply) -> Vec<u8> {
    serde_json::to_vec(reply).expect("control reply serialization cannot fail")
}

/// Decode a CTRL frame payload.
pub fn decode_ctrl_request(payload: &[u8]) -> Result<CtrlRequest> {
    serde_json::from_slice(payload).map_err(|e| anyhow!("invalid control request: {e}"))
}

/// Decode a control reply payload.
pub fn decode_ctrl_reply(payload: &[u8]) -> Result<CtrlReply> {
    serde_json::from_slice(payload).map_err(|e| anyhow!("invalid control reply: {e}"))
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let encoded = encode_request(tag::RPC, 7, b"thrift bytes");
        let mut decoder = RequestDecoder::new(1024);
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag, tag::RPC);
        assert_eq!(frames[0].seq, 7);
        assert_eq!(&frames[0].payload[..], b"thrift bytes");
    }

    #[test]
    fn test_reply_round_trip() {
        let encoded = encode_reply(status::OK, u64::MAX, b"reply");
        let mut decoder = ReplyDecoder::new(1024);
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, status::OK);
        assert_eq!(frames[0].seq, u64::MAX);
        assert_eq!(&frames[0].payload[..], b"reply");
    }

    #[test]
    fn test_empty_ok_payload_round_trip() {
        // Empty OK payload is the legacy handler-raised convention.
        let encoded = encode_reply(status::OK, 3, b"");
        let frames = ReplyDecoder::new(1024).feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_err_reply_carries_description() {
        let encoded = encode_reply(status::ERR, 9, "no such acceptor".as_bytes());
        let frames = ReplyDecoder::new(1024).feed(&encoded).unwrap();
        assert_eq!(frames[0].status, status::ERR);
        assert_eq!(
            std::str::from_utf8(&frames[0].payload).unwrap(),
            "no such acceptor"
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let encoded = encode_request(0x7f, 1, b"x");
        assert!(RequestDecoder::new(1024).feed(&encoded).is_err());
    }

    #[test]
    fn test_unknown_status_rejected() {
        let encoded = encode_reply(0x7f, 1, b"x");
        assert!(ReplyDecoder::new(1024).feed(&encoded).is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        // A frame whose body is shorter than tag + sequence id.
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[tag::RPC, 0, 0, 0]);
        assert!(RequestDecoder::new(1024).feed(&buf).is_err());
    }

    #[test]
    fn test_partial_reassembly() {
        let encoded = encode_request(tag::CTRL, 2, b"{}");
        let mid = encoded.len() / 2;
        let mut decoder = RequestDecoder::new(1024);
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        let frames = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 2);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_request(tag::RPC, 1, b"a"));
        buf.extend_from_slice(&encode_request(tag::CTRL, 2, b"{}"));
        buf.extend_from_slice(&encode_request(tag::RPC, 3, b"c"));

        let frames = RequestDecoder::new(1024).feed(&buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| f.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_ctrl_request_round_trip() {
        let mut acceptors = BTreeMap::new();
        acceptors.insert(0, "echo".to_string());
        acceptors.insert(1, "admin".to_string());
        let req = CtrlRequest::RegisterAcceptors { acceptors };

        let encoded = encode_ctrl_request(&req);
        match decode_ctrl_request(&encoded).unwrap() {
            CtrlRequest::RegisterAcceptors { acceptors } => {
                assert_eq!(acceptors.len(), 2);
                assert_eq!(acceptors[&0], "echo");
                assert_eq!(acceptors[&1], "admin");
            }
            other => panic!("expected RegisterAcceptors, got: {other:?}"),
        }
    }

    #[test]
    fn test_ctrl_reply_round_trip() {
        let mut counters = BTreeMap::new();
        counters.insert("echo.echoString".to_string(), 42u64);
        let reply = CtrlReply::Counters { counters };

        let encoded = encode_ctrl_reply(&reply);
        match decode_ctrl_reply(&encoded).unwrap() {
            CtrlReply::Counters { counters } => {
                assert_eq!(counters["echo.echoString"], 42);
            }
            other => panic!("expected Counters, got: {other:?}"),
        }
    }

    #[test]
    fn test_stack_entry_round_trip() {
        let reply = CtrlReply::Stack {
            entries: vec![StackEntry {
                seq: 5,
                method: "echo.ping".to_string(),
                elapsed_ms: 12,
            }],
        };
        let encoded = encode_ctrl_reply(&reply);
        match decode_ctrl_reply(&encoded).unwrap() {
            CtrlReply::Stack { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].seq, 5);
                assert_eq!(entries[0].method, "echo.ping");
            }
            other => panic!("expected Stack, got: {other:?}"),
        }
    }

    #[test]
    fn test_ctrl_decode_garbage_rejected() {
        assert!(decode_ctrl_request(b"not json").is_err());
        assert!(decode_ctrl_reply(b"{\"type\":\"Nope\"}").is_err());
    }
}
