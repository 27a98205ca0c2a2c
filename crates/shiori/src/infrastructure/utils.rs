use std::future::Future;

use tokio::time::{Duration, sleep};

/// Run `f` up to `attempts` times, doubling `delay` after every failure.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: usize,
    delay: Duration,
    what: &str,
    mut f: F,
) -> Result<T, anyhow::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    error!("failed to fetch {what} after {attempts} attempts: {e}");
                    return Err(e);
                }
                warn!("failed to fetch {what}, attempt {attempt}/{attempts}: {e}");
            }
        }
        sleep(delay.saturating_mul(1 << (attempt - 1).min(16))).await;
    }
}
