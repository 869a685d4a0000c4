//! Error kinds of the dispatch and supervision machinery.
//!
//! Local I/O hiccups (EAGAIN/EINTR) are retried at the call site and a
//! peer close simply tears the connection down, so neither appears here.
//! The variants below are the errors that cross component boundaries.

use thiserror::Error;

/// Errors surfaced by the broker, the process manager, and the waiters.
#[derive(Debug, Error)]
pub enum HiveError {
    /// All workers are saturated and the overflow queue is full.
    #[error("submission rejected: all workers saturated and the overflow queue is full")]
    Backpressure,

    /// The worker a request was routed to exited before replying.
    #[error("worker {0} is gone")]
    WorkerGone(u32),

    /// A frame announced a length above the configured maximum.
    #[error("frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// The worker never answered the handshake, or answered garbage.
    #[error("handshake with worker {pid} failed: {reason}")]
    HandshakeFailed { pid: u32, reason: String },

    /// The supervisor has no process with this id.
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    /// The broker task has shut down; no more submissions are possible.
    #[error("broker is shut down")]
    BrokerClosed,

    /// A waiter was aborted by a signal.
    #[error("waiter aborted")]
    Aborted,

    /// Unrecoverable condition; the master must shut down.
    #[error("terminating: {0}")]
    SystemTerminate(String),
}

impl HiveError {
    /// True for the variants that must end the master process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SystemTerminate(_) | Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(HiveError::SystemTerminate("x".into()).is_fatal());
        assert!(HiveError::Aborted.is_fatal());
        assert!(!HiveError::Backpressure.is_fatal());
        assert!(!HiveError::WorkerGone(3).is_fatal());
    }

    #[test]
    fn test_display_mentions_limit() {
        let err = HiveError::FrameTooLarge { size: 17, limit: 16 };
        let msg = err.to_string();
        assert!(msg.contains("17"));
        assert!(msg.contains("16"));
    }
}
