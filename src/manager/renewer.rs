//! Periodic worker recycling.
//!
//! Once the pool is ready, a timer task checks worker ages every second.
//! The oldest worker (lowest pid) whose age exceeds the TTL gets a
//! SIGTERM (the supervisor respawns it) and the timer backs off to a
//! 60-second repeat delay so workers recycle at most once per minute.
//! With no TTL configured the renewer does nothing.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::constants::{RENEWER_REPEAT_DELAY, RENEWER_RESOLUTION};
use crate::error::HiveError;
use crate::supervisor::Supervisor;

use super::ProcessManager;

/// Handle to the recycling timer task.
#[derive(Debug)]
pub struct Renewer {
    task: Option<JoinHandle<()>>,
}

impl Renewer {
    /// Arm the recycler on the current runtime. A `None` TTL produces an
    /// inert renewer.
    pub fn start(manager: Arc<ProcessManager>, ttl: Option<u64>) -> Self {
        let Some(ttl) = ttl else {
            return Self { task: None };
        };
        let supervisor = manager.supervisor().clone();
        let task = tokio::spawn(run(manager, supervisor, ttl));
        Self { task: Some(task) }
    }

    /// Disarm the recycler.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Renewer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(manager: Arc<ProcessManager>, supervisor: Supervisor, ttl: u64) {
    let mut delay = RENEWER_RESOLUTION;
    loop {
        tokio::time::sleep(delay).await;
        delay = RENEWER_RESOLUTION;

        if !manager.is_ready() {
            continue;
        }

        if let Some(pid) = pick_expired(&manager.bootstrapped_snapshot(), ttl) {
            log::info!("[renewer] worker {pid} exceeded ttl of {ttl}s, sending SIGTERM");
            match supervisor.kill(pid, libc::SIGTERM) {
                Ok(()) | Err(HiveError::ProcessNotFound(_)) => {}
                Err(err) => log::warn!("[renewer] kill worker {pid}: {err}"),
            }
            delay = RENEWER_REPEAT_DELAY;
        }
    }
}

/// First worker (by pid) whose age exceeds the TTL.
fn pick_expired(entries: &[(u32, Instant)], ttl: u64) -> Option<u32> {
    entries
        .iter()
        .find(|(_, registered_at)| registered_at.elapsed().as_secs() > ttl)
        .map(|&(pid, _)| pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pick_expired_prefers_lowest_pid() {
        let old = Instant::now() - Duration::from_secs(100);
        let entries = vec![(3, old), (7, old)];
        assert_eq!(pick_expired(&entries, 10), Some(3));
    }

    #[test]
    fn test_pick_expired_skips_young_workers() {
        let old = Instant::now() - Duration::from_secs(100);
        let young = Instant::now();
        let entries = vec![(1, young), (2, old)];
        assert_eq!(pick_expired(&entries, 10), Some(2));
        assert_eq!(pick_expired(&[(1, young)], 10), None);
    }

    #[test]
    fn test_pick_expired_empty() {
        assert_eq!(pick_expired(&[], 0), None);
    }
}
