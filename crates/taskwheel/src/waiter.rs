use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::clock::Clock;

/// An interruptible sleep between periodic loop iterations.
///
/// [`wait`](Waiter::wait) suspends for up to the configured period.
/// [`wake`](Waiter::wake) makes an in-progress wait return immediately; a
/// wake delivered while nobody is waiting is remembered and consumed by the
/// next wait.
pub struct Waiter {
    period: Duration,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl Waiter {
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            period,
            notify: Notify::new(),
            clock,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Suspend until woken or until the period elapses.
    pub async fn wait(&self) {
        tokio::select! {
            // notify_one stores a permit, so a wake delivered between waits
            // completes the next notified() immediately and is then reset.
            _ = self.notify.notified() => {}
            _ = self.clock.sleep(self.period) => {}
        }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
