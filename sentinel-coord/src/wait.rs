//! Cancellable wait-with-timeout.
//!
//! Polls a check on a fixed interval until it yields a value, the deadline
//! passes, or the caller's cancellation signal flips to `true`. The wait
//! never spins: between polls the task sleeps on the tokio timer.

use std::future::Future;
use std::time::Duration;

use sentinel_core::{SentinelError, SentinelResult};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Why a wait ended without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    TimedOut { waited: Duration },
    Cancelled,
    /// The poll itself failed
    Poll(SentinelError),
}

/// Bounded polling loop with optional external cancellation.
#[derive(Debug, Clone)]
pub struct PollWait {
    timeout: Duration,
    interval: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl PollWait {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval: interval.max(Duration::from_millis(1)),
            cancel: None,
        }
    }

    /// Stop early once `cancel` carries `true`.
    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `poll` until it returns `Some`.
    ///
    /// The poll is always evaluated at least once, even with a zero timeout.
    pub async fn run<T, F, Fut>(mut self, mut poll: F) -> Result<T, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SentinelResult<Option<T>>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            if self.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            if let Some(value) = poll().await.map_err(WaitError::Poll)? {
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut {
                    waited: now.duration_since(started),
                });
            }
            let wake_at = (now + self.interval).min(deadline);

            let mut sender_gone = false;
            match self.cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        _ = sleep_until(wake_at) => {}
                        changed = cancel.changed() => {
                            sender_gone = changed.is_err();
                        }
                    }
                }
                None => sleep_until(wake_at).await,
            }

            if sender_gone && !self.is_cancelled() {
                // Nobody can cancel any more; fall back to plain sleeping
                self.cancel = None;
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}
