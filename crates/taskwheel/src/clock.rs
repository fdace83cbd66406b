use std::time::Duration;

use chrono::{DateTime, Utc};

/// Controls the scheduler's view of time.
///
/// In production the default [`SystemClock`] delegates to `chrono::Utc::now()`
/// and `tokio::time::sleep`. Tests can substitute a clock that returns
/// controlled values so due-time and liveness decisions are deterministic.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// The default clock using real system time.
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
