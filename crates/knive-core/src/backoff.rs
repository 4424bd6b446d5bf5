//! Exponential backoff for reconnects and transient IO retries.

use std::time::Duration;

use crate::error::Result;

/// Exponential backoff state: each call to [`Backoff::next_delay`] returns
/// the current delay and grows it by `factor`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    /// The reconnect schedule of the feed client: 100 ms doubling up to 8 s.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(8), 2)
    }

    /// Short schedule for retrying filesystem operations.
    pub fn io_retry() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1), 2)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.saturating_mul(self.factor);
        self.current = grown.min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Run `op` up to `attempts` times, sleeping between tries while the error
/// is transient.
pub async fn retry_transient<T, F, Fut>(attempts: usize, mut backoff: Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff.next_delay();
                tracing::warn!("Transient error (attempt {attempt}/{attempts}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
