//! Transient-error retries bounded by a deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::ClusterError;

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// Exponential backoff, doubling up to a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: INITIAL_DELAY,
            max: MAX_DELAY,
        }
    }
}

impl Backoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Run `op`, retrying transient errors until `deadline`. Non-transient errors
/// and the last transient error are returned as-is.
pub(crate) async fn retry_transient<T, F, Fut>(
    what: &str,
    deadline: Instant,
    mut op: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let mut backoff = Backoff::default();
    loop {
        match op().await {
            Err(err) if err.is_transient() => {
                let delay = backoff.next_delay();
                if Instant::now() + delay >= deadline {
                    return Err(err);
                }
                debug!(operation = what, error = %err, delay_ms = delay.as_millis(), "Retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let deadline = Instant::now() + Duration::from_secs(30);
        let result = retry_transient("delete", deadline, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::Transient("throttled".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_deadline() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let result: Result<(), _> = retry_transient("delete", deadline, || async {
            Err(ClusterError::Transient("throttled".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert!(Instant::now() <= deadline);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let deadline = Instant::now() + Duration::from_secs(30);
        let result: Result<(), _> = retry_transient("delete", deadline, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::Api {
                code: 403,
                message: "forbidden".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
