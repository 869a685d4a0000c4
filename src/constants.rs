//! Application-wide constants for thrifthive.
//!
//! This module centralizes magic numbers so the tunables of the dispatch
//! and supervision machinery live in one place. Constants are grouped by
//! domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Framing**: wire limits
//! - **Accepting**: accept-loop batching and cooldowns
//! - **Dispatch**: broker queue limits
//! - **Supervision**: worker stream fds, respawn pacing, renewer cadence

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Default maximum frame size (16 MiB).
///
/// Applies to client frames and to worker IPC frames alike. Overridable
/// through `Config::max_frame_size`.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read buffer size for socket read loops (64 KiB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Accepting
// ============================================================================

/// How many sockets an acceptor takes per wakeup before yielding.
///
/// Bounding the batch keeps one busy listener from starving the other
/// tasks sharing the loop.
pub const ACCEPT_BATCH: usize = 64;

/// Cooldown after a failed `accept()` (EMFILE and friends).
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Dispatch
// ============================================================================

/// Upper bound on submissions queued while every worker is saturated.
///
/// Beyond this the broker rejects the submission with `Backpressure`.
pub const PENDING_LIMIT: usize = 1024;

// ============================================================================
// Supervision
// ============================================================================

/// Child-side file descriptor of the handshake stream.
pub const HANDSHAKE_FD: i32 = 3;

/// Child-side file descriptor of the incoming (master → worker) stream.
pub const INCOMING_FD: i32 = 4;

/// Child-side file descriptor of the outgoing (worker → master) stream.
pub const OUTGOING_FD: i32 = 5;

/// Environment variable that marks a process as a worker.
pub const IS_WORKER_ENV: &str = "IS_WORKER";

/// Pause before respawning an exited worker.
///
/// Keeps a crash-looping worker command from pinning a core.
pub const RESPAWN_DELAY: Duration = Duration::from_millis(100);

/// How often the renewer checks worker ages once the pool is ready.
pub const RENEWER_RESOLUTION: Duration = Duration::from_secs(1);

/// Minimum delay between two TTL recycles.
pub const RENEWER_REPEAT_DELAY: Duration = Duration::from_secs(60);
