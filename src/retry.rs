use std::future::Future;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

/// A fixed attempt budget with a fixed pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects, or the
    /// budget is used up. The last error is returned.
    ///
    /// The backoff is only slept for errors where [`Error::wants_backoff`] holds.
    pub async fn run<T, F, Fut>(&self, retryable: impl Fn(&Error) -> bool, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && retryable(&err) => {
                    debug!("Attempt {attempt} of {} failed: {err}", self.attempts);
                    if err.wants_backoff() {
                        debug!("Backing off {:?}", self.backoff);
                        tokio::time::sleep(self.backoff).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let result: Result<()> = policy
            .run(Error::is_transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transport("write failed".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let result: Result<()> = policy
            .run(Error::is_transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::CharacteristicMissing("Read"))
            })
            .await;
        assert!(matches!(result, Err(Error::CharacteristicMissing(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_between_bus_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let start = Instant::now();
        let result = policy
            .run(Error::is_transient, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Bus("org.bluez.Error.InProgress".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_for_plain_transport_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let start = Instant::now();
        let result = policy
            .run(Error::is_transient, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::ResponseTimeout(Duration::from_secs(5)))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
