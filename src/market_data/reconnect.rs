use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// How long a feed reader waits between connection attempts.
///
/// The wait is a fixed interval plus optional uniform jitter, and is always
/// cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    interval: Duration,
    jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::ZERO,
        }
    }

    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay for the next attempt.
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval + Duration::from_millis(extra)
    }

    /// Sleep for `next_delay()`. Returns `false` if cancelled first, in which
    /// case the caller must not reconnect.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.next_delay()) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
