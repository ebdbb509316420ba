use std::future::Future;
use std::time::Duration;

use rand::Rng;
use saga_store::StoreError;
use tracing::warn;

/// Exponential backoff with jitter for retryable session store errors.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
        }
    }
}

impl Backoff {
    /// `base * 2^attempt`, capped, then spread by `±jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let spread = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.retry_when(what, StoreError::is_retryable, op).await
    }

    /// Like [`Backoff::retry`], but only errors accepted by `retry_on` are
    /// tried again.
    pub async fn retry_when<T, F, Fut, P>(
        &self,
        what: &str,
        retry_on: P,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
        P: Fn(&StoreError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry_on(&e) && attempt + 1 < self.attempts.max(1) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying session store call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
