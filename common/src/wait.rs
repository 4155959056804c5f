use anyhow::{Result, bail};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_WAIT_ITERATIONS: usize = 50;
const DEFAULT_CAP: Duration = Duration::from_secs(10);

pub async fn wait(cancel: &CancellationToken, n: usize) -> Result<()> {
    wait_with_backoff(cancel, n, DEFAULT_CAP).await
}

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub async fn wait_with_backoff(cancel: &CancellationToken, n: usize, cap: Duration) -> Result<()> {
    let n = n.clamp(1, MAX_WAIT_ITERATIONS);

    let base = Duration::from_millis(250);

    for attempt in 0..n {
        let delay = backoff_full_jitter(base, cap, attempt);

        tokio::select! {
            _ = cancel.cancelled() => bail!("Context cancelled"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Ok(())
}

fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let exp = base.saturating_mul(1_u32 << attempt.min(16) as u32);
    let ceiling = exp.min(cap);
    let ceiling_ms = ceiling.as_millis().max(1) as u64;
    Duration::from_millis(rand::random_range(0..ceiling_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_under_cap() {
        let cap = Duration::from_millis(500);
        for attempt in 0..20 {
            let d = backoff_full_jitter(Duration::from_millis(250), cap, attempt);
            assert!(d < cap, "attempt {attempt} produced {d:?}");
        }
    }

    #[tokio::test]
    async fn wait_bails_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(wait(&cancel, 3).await.is_err());
    }
}
