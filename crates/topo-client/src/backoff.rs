use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: Option<E> },
    Shutdown,
}

/// Run `op` up to `policy.max_attempts` times. After each failure, including
/// the last one, sleep the current delay and then double it. A shutdown
/// signal interrupts the sleep.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delay = policy.initial_delay;
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        if is_shutdown(shutdown) {
            return Err(RetryError::Shutdown);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    event = "retry_failed",
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                last = Some(err);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(shutdown) => return Err(RetryError::Shutdown),
        }
        delay = next_backoff(delay);
    }
    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    let stop = *shutdown.borrow();
    stop
}

pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if is_shutdown(shutdown) || shutdown.changed().await.is_err() {
            return;
        }
    }
}
