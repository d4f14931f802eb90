//! Retry loop with a growing delay.

use super::Result;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

const BASE_DELAY_MS: u64 = 100;
const MAX_EXPONENT: u32 = 6;

/// Delay of `100ms * (3^attempt - 1)`, with the exponent capped at 6.
///
/// The first retry is immediate, the longest delay is about 73 seconds.
#[derive(Debug, Default, Clone)]
pub struct RetryDelayStrategy {
    attempt: u32,
}

impl RetryDelayStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&self) -> Duration {
        let factor = 3u64.pow(self.attempt.min(MAX_EXPONENT)) - 1;
        Duration::from_millis(BASE_DELAY_MS * factor)
    }

    /// Sleep for the current delay and move to the next attempt.
    pub async fn wait(&mut self) {
        sleep(self.next_delay()).await;
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds or fails with an error that can not be
/// retried (see [`SessionError::can_retry`](super::SessionError::can_retry)).
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut strategy = RetryDelayStrategy::new();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.can_retry() => {
                warn!("Retrying after error (attempt {}): {}", strategy.attempt() + 1, e);
            }
            Err(e) => return Err(e),
        }
        strategy.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let delays: Vec<u64> = (0..9)
            .map(|attempt| RetryDelayStrategy { attempt }.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![0, 200, 800, 2_600, 8_000, 24_200, 72_800, 72_800, 72_800]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = with_retry(move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(SessionError::Transport("connection reset".to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        // 0 + 200 + 800 ms of back-off
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_unauthorized() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_retry(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Unauthorized)
        })
        .await;

        assert!(matches!(result, Err(SessionError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
