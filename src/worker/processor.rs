//! The processor seam between the container and the Thrift library.
//!
//! The container never parses Thrift itself. A [`FrameProcessor`] takes
//! one request frame (the bytes between the length prefixes) and returns
//! one reply frame; everything protocol-shaped happens behind this trait.
//! [`ThriftBinaryProcessor`] adapts any `thrift::server::TProcessor`
//! (generated from IDL) onto it; [`EchoProcessor`] is the demo service
//! the binary ships and the tests exercise.

use std::sync::Arc;

use anyhow::{Context, Result};
use thrift::protocol::{TBinaryInputProtocol, TBinaryOutputProtocol, TInputProtocol};
use thrift::server::TProcessor;
use thrift::transport::TBufferChannel;

/// One request/response exchange over raw frames.
///
/// Implementations must be cheap to share: the worker holds one instance
/// per service for the life of the process and calls it from concurrent
/// tasks in `concurrent` mode.
pub trait FrameProcessor: Send + Sync {
    /// Process a request frame into a reply frame.
    ///
    /// An error here means the handler (or the protocol layer) raised;
    /// the worker converts it into the legacy empty-OK reply.
    fn process(&self, request: &[u8]) -> Result<Vec<u8>>;

    /// Method name recoverable from the request without executing it.
    ///
    /// Labels counters, timers, and in-flight stack entries; `None`
    /// falls back to `unknown`.
    fn peek_method(&self, request: &[u8]) -> Option<String> {
        let _ = request;
        None
    }
}

/// Demo processor: replies with the request bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

impl FrameProcessor for EchoProcessor {
    fn process(&self, request: &[u8]) -> Result<Vec<u8>> {
        Ok(request.to_vec())
    }

    fn peek_method(&self, _request: &[u8]) -> Option<String> {
        Some("echo".to_string())
    }
}

/// Adapter running a generated `TProcessor` over in-memory buffers.
///
/// The request frame is loaded into a read channel, the processor is
/// advanced once with binary protocols on both sides, and the write
/// channel's contents become the reply frame. The write buffer is sized
/// at the request size plus headroom; services whose replies are much
/// larger than their requests should construct the adapter with an
/// explicit `reply_capacity`.
pub struct ThriftBinaryProcessor<P> {
    inner: P,
    reply_capacity: usize,
}

impl<P> std::fmt::Debug for ThriftBinaryProcessor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThriftBinaryProcessor")
            .field("reply_capacity", &self.reply_capacity)
            .finish_non_exhaustive()
    }
}

/// Headroom added to the request size when sizing the reply buffer.
const REPLY_HEADROOM: usize = 64 * 1024;

impl<P> ThriftBinaryProcessor<P>
where
    P: TProcessor + Send + Sync,
{
    /// Wrap a generated processor with the default reply buffer sizing.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            reply_capacity: 0,
        }
    }

    /// Wrap a generated processor with a fixed reply buffer capacity.
    pub fn with_reply_capacity(inner: P, reply_capacity: usize) -> Self {
        Self {
            inner,
            reply_capacity,
        }
    }

    fn capacity_for(&self, request_len: usize) -> usize {
        if self.reply_capacity > 0 {
            self.reply_capacity
        } else {
            request_len + REPLY_HEADROOM
        }
    }
}

impl<P> FrameProcessor for ThriftBinaryProcessor<P>
where
    P: TProcessor + Send + Sync,
{
    fn process(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut read_channel = TBufferChannel::with_capacity(request.len(), 0);
        read_channel.set_readable_bytes(request);
        let write_channel = TBufferChannel::with_capacity(0, self.capacity_for(request.len()));

        let mut input = TBinaryInputProtocol::new(read_channel, true);
        let mut output = TBinaryOutputProtocol::new(write_channel, true);

        self.inner
            .process(&mut input, &mut output)
            .context("thrift processor")?;

        Ok(output.transport.write_bytes())
    }

    fn peek_method(&self, request: &[u8]) -> Option<String> {
        read_message_name(request)
    }
}

/// Recover the method name from a binary-protocol message header.
///
/// Best effort: a request the protocol cannot parse yields `None` and is
/// counted under `unknown`.
fn read_message_name(request: &[u8]) -> Option<String> {
    let mut channel = TBufferChannel::with_capacity(request.len(), 0);
    channel.set_readable_bytes(request);
    let mut input = TBinaryInputProtocol::new(channel, true);
    input.read_message_begin().ok().map(|ident| ident.name)
}

impl<T: FrameProcessor + ?Sized> FrameProcessor for Arc<T> {
    fn process(&self, request: &[u8]) -> Result<Vec<u8>> {
        (**self).process(request)
    }

    fn peek_method(&self, request: &[u8]) -> Option<String> {
        (**self).peek_method(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_callable_through_arc() {
        let processor: Arc<dyn FrameProcessor> = Arc::new(EchoProcessor);
        assert_eq!(processor.process(b"via arc").unwrap(), b"via arc");
        assert_eq!(processor.peek_method(b"via arc").as_deref(), Some("echo"));
    }

    #[test]
    fn test_echo_returns_request_unchanged() {
        let processor = EchoProcessor;
        assert_eq!(processor.process(b"payload bytes").unwrap(), b"payload bytes");
        assert_eq!(processor.peek_method(b"payload bytes").as_deref(), Some("echo"));
    }

    #[test]
    fn test_echo_empty_request() {
        assert!(EchoProcessor.process(b"").unwrap().is_empty());
    }

    #[test]
    fn test_peek_method_defaults_to_none() {
        struct Opaque;
        impl FrameProcessor for Opaque {
            fn process(&self, request: &[u8]) -> Result<Vec<u8>> {
                Ok(request.to_vec())
            }
        }
        assert!(Opaque.peek_method(b"anything").is_none());
    }

    #[test]
    fn test_read_message_name_on_garbage_is_none() {
        assert!(read_message_name(b"definitely not thrift").is_none());
        assert!(read_message_name(b"").is_none());
    }

    #[test]
    fn test_read_message_name_reads_binary_protocol_header() {
        // Encode a strict binary-protocol CALL header for "ping".
        use thrift::protocol::{TMessageIdentifier, TMessageType, TOutputProtocol};

        let channel = TBufferChannel::with_capacity(0, 256);
        let mut output = TBinaryOutputProtocol::new(channel, true);
        output
            .write_message_begin(&TMessageIdentifier::new("ping", TMessageType::Call, 1))
            .unwrap();
        output.write_message_end().unwrap();
        output.flush().unwrap();
        let bytes = output.transport.write_bytes();

        assert_eq!(read_message_name(&bytes).as_deref(), Some("ping"));
    }
}
