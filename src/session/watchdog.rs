//! Idle session watchdog

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::CancellationSignal;

/// Shared last-activity timestamp, touched by the relay on every frame.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Cancels a session after `max_idle` without relay activity.
pub struct IdleWatchdog;

impl IdleWatchdog {
    /// Start watching. The task exits when it fires or when the signal is
    /// cancelled by someone else.
    pub fn spawn(
        clock: ActivityClock,
        max_idle: Duration,
        check_every: Duration,
        signal: CancellationSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => return,
                    _ = tokio::time::sleep(check_every) => {
                        let idle = clock.idle_for();
                        if idle >= max_idle {
                            info!("Session idle for {:?} (limit {:?}), cancelling", idle, max_idle);
                            signal.cancel();
                            return;
                        }
                    }
                }
            }
        })
    }
}
