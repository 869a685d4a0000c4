//! The hub: per-process event loop ownership.
//!
//! # Architecture
//!
//! ```text
//! Main thread                         Hub thread
//! ┌─────────────────────┐            ┌──────────────────────────┐
//! │ bootstrap           │            │ current-thread runtime   │
//! │   │                 │──spawn───► │   acceptors, connections │
//! │   ├─ call()/        │            │   broker, supervisor,    │
//! │   │  block_on()     │◄─result──  │   manager tasks          │
//! │   └─ Waiter::wait() │            │                          │
//! └─────────────────────┘            └──────────────────────────┘
//! ```
//!
//! The master runs exactly two long-lived threads: the main thread
//! (bootstraps, waits on [`Waiter`]s, receives termination signals) and
//! the hub thread, which drives a single-threaded tokio runtime owning
//! every socket, pipe, and piece of broker state. Code that used to be a
//! suspendable task is an async task here; a watcher wait is an `.await`.
//!
//! Cross-thread calls into the loop go through [`Hub::call`] and
//! [`Hub::block_on`]: the closure or future is scheduled on the loop
//! thread and the caller blocks until it has run, getting its result
//! back. Calling either from the loop thread itself is a bug (it would
//! deadlock the loop) and is rejected with an error.

pub mod waiter;

pub use waiter::Waiter;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::oneshot;

struct HubInner {
    handle: tokio::runtime::Handle,
    loop_thread: thread::ThreadId,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Owner of the event loop thread.
///
/// Created once per process. `start` launches the loop thread, `stop`
/// breaks the loop and joins it; both are idempotent.
pub struct Hub {
    started: AtomicBool,
    stopped: AtomicBool,
    inner: Mutex<Option<HubInner>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Create a hub. The loop thread is not launched until [`Hub::start`].
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            inner: Mutex::new(None),
        }
    }

    /// Launch the loop thread. Returns once the loop accepts work.
    ///
    /// Idempotent: the second call is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("thrifthive-hub".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let _ = ready_tx.send(Ok(tokio::runtime::Handle::current()));
                    // Park until stop() breaks the loop.
                    let _ = shutdown_rx.await;
                });
            })
            .context("spawn hub thread")?;

        let handle = ready_rx
            .recv()
            .map_err(|_| anyhow!("hub thread died during startup"))?
            .context("build hub runtime")?;

        let loop_thread = thread.thread().id();
        *self.inner.lock().expect("hub mutex poisoned") = Some(HubInner {
            handle,
            loop_thread,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        });

        Ok(())
    }

    /// Break the loop and join the loop thread.
    ///
    /// Pending tasks are dropped. Idempotent: the second call is a no-op.
    pub fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, thread) = {
            let mut guard = self.inner.lock().expect("hub mutex poisoned");
            match guard.as_mut() {
                Some(inner) => (inner.shutdown_tx.take(), inner.thread.take()),
                None => (None, None),
            }
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Handle to the loop runtime, for spawning tasks from any thread.
    pub fn handle(&self) -> Result<tokio::runtime::Handle> {
        let guard = self.inner.lock().expect("hub mutex poisoned");
        match guard.as_ref() {
            Some(inner) if !self.stopped.load(Ordering::SeqCst) => Ok(inner.handle.clone()),
            _ => bail!("hub is not running"),
        }
    }

    /// Spawn a task on the loop thread. Safe from any thread.
    pub fn spawn<F>(&self, future: F) -> Result<tokio::task::JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.handle()?.spawn(future))
    }

    /// Run a future on the loop thread, blocking the caller for its result.
    ///
    /// # Errors
    ///
    /// Fails when called from the loop thread itself (it would deadlock
    /// the loop) or when the loop has died.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = {
            let guard = self.inner.lock().expect("hub mutex poisoned");
            let inner = match guard.as_ref() {
                Some(inner) if !self.stopped.load(Ordering::SeqCst) => inner,
                _ => bail!("hub is not running"),
            };
            if thread::current().id() == inner.loop_thread {
                bail!("blocking call on the event loop thread");
            }
            inner.handle.clone()
        };

        let (tx, rx) = mpsc::channel();
        handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv().map_err(|_| anyhow!("event loop dropped the call"))
    }

    /// Run a closure on the loop thread, blocking the caller for its result.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.block_on(async move { f() })
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_start_is_idempotent() {
        let hub = Hub::new();
        hub.start().unwrap();
        hub.start().unwrap();
        assert_eq!(hub.call(|| 41 + 1).unwrap(), 42);
        hub.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let hub = Hub::new();
        hub.start().unwrap();
        hub.stop();
        hub.stop();
        assert!(hub.call(|| ()).is_err());
    }

    #[test]
    fn test_call_returns_value_from_loop_thread() {
        let hub = Hub::new();
        hub.start().unwrap();
        let loop_thread = hub.call(|| thread::current().id()).unwrap();
        assert_ne!(loop_thread, thread::current().id());
        hub.stop();
    }

    #[test]
    fn test_block_on_runs_async_work() {
        let hub = Hub::new();
        hub.start().unwrap();
        let value = hub
            .block_on(async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                7
            })
            .unwrap();
        assert_eq!(value, 7);
        hub.stop();
    }

    #[test]
    fn test_callbacks_run_in_post_order() {
        let hub = Hub::new();
        hub.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            hub.spawn(async move {
                seen.lock().unwrap().push(i);
            })
            .unwrap();
        }
        // A blocking call acts as a barrier behind the posted tasks.
        hub.call(|| ()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..50).collect::<Vec<_>>());
        hub.stop();
    }

    #[test]
    fn test_blocking_call_from_loop_thread_is_rejected() {
        let hub = Arc::new(Hub::new());
        hub.start().unwrap();

        let inner = Arc::clone(&hub);
        let result = hub.block_on(async move { inner.call(|| ()).is_err() }).unwrap();
        assert!(result, "re-entrant blocking call must fail");
        hub.stop();
    }
}
