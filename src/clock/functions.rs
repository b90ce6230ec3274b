//! The trait and the wall clock implementation
//!
use std::{fmt::Debug, thread, time::{Duration, Instant}};

/// Interval between two status reads in the polling loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time provider for polling loops.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Production clock: `Instant` based, sleeps the current thread.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Poll `condition` every [POLL_INTERVAL] until it returns true or `timeout` elapsed.
/// The condition is evaluated once more after the deadline; its last answer is returned.
pub fn wait_until<F>(
    clock: &dyn Clock,
    timeout: Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = clock.now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if clock.now() >= deadline {
            return false;
        }
        clock.sleep(POLL_INTERVAL);
    }
}
