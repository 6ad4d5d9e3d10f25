//! Cooperative cancellation and status polling
//!
//! Cancellation never interrupts a provider call. Long-running steps poll
//! their token between attempts and stop on their own.

use crate::error::ConnectorError;
use crate::models::ResourceId;
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens keyed by resource id
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<ResourceId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the resource's current operation, created on first use
    pub fn token(&self, resource_id: ResourceId) -> CancellationToken {
        self.tokens.entry(resource_id).or_default().clone()
    }

    /// Signal every step running for the resource to stop
    pub fn cancel(&self, resource_id: ResourceId) {
        let token = self.token(resource_id);
        token.cancel();
        tracing::info!(resource_id, "Cancellation requested");
    }

    pub fn is_cancelled(&self, resource_id: ResourceId) -> bool {
        self.tokens
            .get(&resource_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// Forget a fired token so that the next operation on the resource starts
    /// uncancelled
    pub fn reset(&self, resource_id: ResourceId) {
        self.tokens
            .remove_if(&resource_id, |_, token| token.is_cancelled());
    }
}

/// How often and how long a status poll runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
        }
    }
}

/// Why a poll loop stopped without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    Cancelled,
    Exhausted { attempts: u32 },
}

/// Run `attempt` until it yields a value, the token fires or the attempts run
/// out. The token is consulted before every attempt and while sleeping.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    token: &CancellationToken,
    mut attempt: F,
) -> Result<PollOutcome<T>, ConnectorError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, ConnectorError>>,
{
    for round in 1..=policy.max_attempts {
        if token.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }

        if let Some(value) = attempt(round).await? {
            return Ok(PollOutcome::Ready(value));
        }

        if round == policy.max_attempts {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    Ok(PollOutcome::Exhausted {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_poll_returns_first_ready_value() {
        let token = CancellationToken::new();
        let outcome = poll_until(&fast_policy(5), &token, |round| async move {
            Ok(if round == 3 { Some(round) } else { None })
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(3));
    }

    #[tokio::test]
    async fn test_poll_exhausts_attempts() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: PollOutcome<()> = poll_until(&fast_policy(4), &token, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_stops_when_cancelled_between_attempts() {
        let token = CancellationToken::new();
        let trigger = token.clone();

        let outcome: PollOutcome<()> = poll_until(&fast_policy(100), &token, move |round| {
            let trigger = trigger.clone();
            async move {
                if round == 2 {
                    trigger.cancel();
                }
                Ok(None)
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_propagates_errors() {
        let token = CancellationToken::new();
        let result: Result<PollOutcome<()>, _> = poll_until(&fast_policy(3), &token, |_| async {
            Err(ConnectorError::provider("throttled"))
        })
        .await;

        assert_eq!(result.unwrap_err(), ConnectorError::provider("throttled"));
    }

    #[test]
    fn test_registry_cancel_and_reset() {
        let registry = CancellationRegistry::new();
        let token = registry.token(9);
        assert!(!registry.is_cancelled(9));

        registry.cancel(9);
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled(9));

        registry.reset(9);
        assert!(!registry.is_cancelled(9));
        assert!(!registry.token(9).is_cancelled());
    }
}
