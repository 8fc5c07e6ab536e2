// ABOUTME: Bounded polling with a fixed interval and optional cancellation
// ABOUTME: Used to wait for a thread parent's identity and for Slack file shares to appear

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times to probe and how long to wait between probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Parent lookup budget: 60 probes, one second apart
    pub fn parent_lookup() -> Self {
        Self::new(60, Duration::from_secs(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::parent_lookup()
    }
}

/// Definite result of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult<T> {
    Found { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl<T> PollResult<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Found { attempts, .. }
            | Self::Exhausted { attempts }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Probe until it yields a value, the budget runs out, or `cancel` fires.
///
/// A probe error counts as "not yet" and is logged; it never ends the poll early.
pub async fn poll<T, F, Fut>(
    policy: RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut probe: F,
) -> PollResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return PollResult::Cancelled {
                attempts: attempt - 1,
            };
        }

        match probe().await {
            Ok(Some(value)) => {
                return PollResult::Found {
                    value,
                    attempts: attempt,
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(attempt, error = %e, "Poll probe failed"),
        }

        if attempt == max_attempts {
            break;
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return PollResult::Cancelled { attempts: attempt };
                    }
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
            None => tokio::time::sleep(policy.interval).await,
        }
    }

    PollResult::Exhausted {
        attempts: max_attempts,
    }
}
