//! Restart loop with exponential backoff.
//!
//! K_i: Restarts are unbounded; only the delay is capped.
//! K_i: A clean exit ends the loop, cancellation ends it at the next await.

use crate::models::{Result, SupervisorConfig};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl ExpBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay(), config.multiplier)
    }

    /// Delay before restart number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `service` until it succeeds or `cancel` fires, restarting after
/// every error.
///
/// Each run gets the loop's token so cancellation reaches the child.
/// Returns the number of restarts performed.
pub async fn retrying<F, Fut>(backoff: &ExpBackoff, cancel: &CancellationToken, mut service: F) -> u32
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut restarts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return restarts;
        }

        match service(cancel.clone()).await {
            Ok(()) => {
                info!(restarts, "Service exited cleanly, not restarting");
                return restarts;
            }
            Err(e) if cancel.is_cancelled() => {
                info!(error = %e, "Service stopped by shutdown");
                return restarts;
            }
            Err(e) => {
                let delay = backoff.delay(restarts);
                restarts += 1;
                error!(
                    error = %e,
                    restarts,
                    delay_secs = delay.as_secs_f64(),
                    "Service failed, restarting after delay"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return restarts,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExportError;

    #[test]
    fn test_delay_grows_and_caps() {
        let b = ExpBackoff::new(Duration::from_secs(15), Duration::from_secs(3600), 2.0);
        assert_eq!(b.delay(0), Duration::from_secs(15));
        assert_eq!(b.delay(1), Duration::from_secs(30));
        assert_eq!(b.delay(2), Duration::from_secs(60));
        assert_eq!(b.delay(8), Duration::from_secs(3600));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_restarts_until_success() {
        let b = ExpBackoff::new(Duration::ZERO, Duration::ZERO, 2.0);
        let cancel = CancellationToken::new();
        let mut runs = 0;

        let restarts = retrying(&b, &cancel, |_token| {
            runs += 1;
            let fail = runs < 3;
            async move {
                if fail {
                    Err(ExportError::ChildExited("exit status: 1".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(restarts, 2);
        assert_eq!(runs, 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let b = ExpBackoff::new(Duration::from_secs(3600), Duration::from_secs(3600), 2.0);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let restarts = retrying(&b, &cancel, |_token| async {
            Err(ExportError::ChildExited("boom".into()))
        })
        .await;
        assert_eq!(restarts, 1);
    }
}
