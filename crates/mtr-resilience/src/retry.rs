//! ---
//! mtr_section: "07-resilience-fault-tolerance"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Bounded retry policy."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use mtr_common::{Classify, ErrorKind};
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up. Never zero.
    pub max_attempts: usize,
    /// Fixed pause after each failed attempt except the last.
    pub backoff: Duration,
    /// Upper bound of random delay added to each pause.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy with a fixed backoff and no jitter.
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of random delay to every pause.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn pause(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.backoff;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1)) as u64;
        self.backoff + Duration::from_millis(jitter_ms)
    }

    /// Run `operation` until it succeeds or the attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. `label` only tags the
    /// log events.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<Succeeded<T>, RetryExhausted<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display,
    {
        self.run_with(label, &mut operation, |operation, attempt| {
            Box::pin(operation(attempt))
        })
        .await
    }

    /// Run `operation` with `ctx` lent mutably to every attempt.
    ///
    /// Used when each attempt needs exclusive access to a resource that the
    /// caller already holds, such as a locked bus.
    pub async fn run_with<C, T, E, F>(
        &self,
        label: &str,
        ctx: &mut C,
        mut operation: F,
    ) -> Result<Succeeded<T>, RetryExhausted<E>>
    where
        C: ?Sized,
        F: for<'a> FnMut(&'a mut C, usize) -> AttemptFuture<'a, T, E>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation(&mut *ctx, attempt).await {
                Ok(value) => {
                    debug!(target: "mtr::resilience::retry", label, attempt, "attempt succeeded");
                    return Ok(Succeeded {
                        value,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    warn!(
                        target: "mtr::resilience::retry",
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "attempt failed",
                    );
                    if attempt >= self.max_attempts {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                }
            }
            let pause = self.pause();
            if !pause.is_zero() {
                sleep(pause).await;
            }
            attempt += 1;
        }
    }
}

/// Boxed future returned by one attempt of [`RetryPolicy::run_with`].
pub type AttemptFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Value of the first successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Succeeded<T> {
    /// What the operation returned.
    pub value: T,
    /// Attempts used, including the successful one.
    pub attempts: usize,
}

impl<T> Succeeded<T> {
    /// Failed attempts that preceded success.
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Every attempt failed; carries the last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// Attempts made.
    pub attempts: usize,
    /// Error of the final attempt.
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

impl<E> std::error::Error for RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}

impl<E> Classify for RetryExhausted<E> {
    fn kind(&self) -> ErrorKind {
        ErrorKind::RetryExhausted
    }
}
