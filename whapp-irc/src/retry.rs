//! Fixed-delay retry combinator.

use std::future::Future;
use std::time::Duration;

/// How often and how far apart to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds, `retryable` rejects its error, or
/// `policy.attempts` are used up. `op` receives the 1-based attempt number.
/// The error of the last attempt is returned.
pub async fn retry<T, E, F, Fut, R>(policy: RetryPolicy, mut op: F, retryable: R) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                tracing::warn!(attempt, max = attempts, "attempt failed, retrying: {e}");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts_one_second_apart() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let result: Result<(), String> = retry(
            RetryPolicy::default(),
            |n| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.lock().unwrap().push((n, start.elapsed()));
                    Err(format!("open failed ({n})"))
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "open failed (5)");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        for (i, (n, at)) in calls.iter().enumerate() {
            assert_eq!(*n, i as u32 + 1);
            assert_eq!(at.as_secs(), i as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let mut seen = 0;
        let result = retry(
            RetryPolicy::default(),
            |n| {
                seen = n;
                async move { if n < 3 { Err("not yet") } else { Ok(n * 10) } }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(30));
        assert_eq!(seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let mut count = 0;
        let result: Result<(), &str> = retry(
            RetryPolicy::default(),
            |_| {
                count += 1;
                async { Err("fatal") }
            },
            |e| *e != "fatal",
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(count, 1);
    }
}
