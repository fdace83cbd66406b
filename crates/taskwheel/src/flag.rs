use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    state: AtomicBool,
    notify: Notify,
}

/// A one-shot async flag signalling scheduler shutdown.
#[derive(Clone)]
pub(crate) struct ShutdownFlag(Arc<Shared>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.state.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.state.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }

            let notified = self.0.notify.notified();

            // Re-check after registering so a raise between the check and the
            // registration is not lost.
            if self.is_raised() {
                return;
            }

            notified.await;
        }
    }
}

/// Raises the flag when a background loop unwinds, so the remaining loops
/// stop instead of running against a half-dead scheduler.
pub(crate) struct ShutdownGuard<'a>(&'a ShutdownFlag);

impl<'a> ShutdownGuard<'a> {
    pub fn new(flag: &'a ShutdownFlag) -> Self {
        Self(flag)
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("scheduler loop exiting without the shutdown flag being raised");
        }

        self.0.raise();
    }
}
