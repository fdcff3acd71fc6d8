//! Randomized linear backoff and the retrying peer sender.
//!
//! Before retry `n` the sender waits a uniformly random duration in
//! `[0, base * n]`. The same delay policy is shared by the HTTP fetcher.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::link::PeerLink;
use crate::message::PeerMessage;
use crate::state::{RelayState, bump};

/// Random delay in `[0, base * attempt]`.
pub fn jitter(base: Duration, attempt: u32) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let ceiling = base_ms.saturating_mul(u64::from(attempt));
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

/// Terminal outcome of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

impl Delivery {
    pub fn is_delivered(self) -> bool {
        self == Delivery::Delivered
    }
}

pub struct BackoffSender<L> {
    link: L,
    max_attempts: u32,
    retry_base: Duration,
    state: Arc<RelayState>,
}

impl<L: PeerLink> BackoffSender<L> {
    pub fn new(link: L, max_attempts: u32, retry_base: Duration, state: Arc<RelayState>) -> Self {
        Self {
            link,
            max_attempts,
            retry_base,
            state,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Deliver one message, retrying rejected attempts. A message that
    /// exhausts its attempts is logged and dropped.
    pub async fn send(&self, message: &PeerMessage) -> Delivery {
        let dict = message.to_dictionary();
        let kind = message.kind();
        let mut attempts = 0;

        while attempts < self.max_attempts {
            match self.link.deliver(&dict).await {
                Ok(()) => {
                    debug!(kind, attempt = attempts + 1, "Delivered message");
                    bump(&self.state.messages_delivered);
                    return Delivery::Delivered;
                }
                Err(e) => {
                    attempts += 1;
                    warn!(kind, attempt = attempts, error = %e, "Delivery attempt failed");
                    if attempts < self.max_attempts {
                        tokio::time::sleep(jitter(self.retry_base, attempts)).await;
                    }
                }
            }
        }

        error!(
            kind,
            attempts,
            content = ?dict,
            "Failed sending message. Dropping it."
        );
        bump(&self.state.messages_dropped);
        Delivery::Dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::message::Dictionary;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Rejects the first `failures` attempts.
    struct FlakyLink {
        failures: u32,
        attempts: AtomicU32,
        delivered: Mutex<Vec<Dictionary>>,
    }

    impl FlakyLink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    impl PeerLink for FlakyLink {
        async fn deliver(&self, dict: &Dictionary) -> Result<(), LinkError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(LinkError::Rejected {
                    receipt: u64::from(attempt),
                    reason: "busy".into(),
                });
            }
            self.delivered.lock().unwrap().push(dict.clone());
            Ok(())
        }
    }

    fn sender(failures: u32) -> BackoffSender<FlakyLink> {
        BackoffSender::new(
            FlakyLink::new(failures),
            7,
            Duration::from_millis(2_000),
            Arc::new(RelayState::new()),
        )
    }

    #[test]
    fn jitter_stays_within_linear_bound() {
        let base = Duration::from_millis(2_000);
        for attempt in 1..=7 {
            for _ in 0..50 {
                assert!(jitter(base, attempt) <= base * attempt);
            }
        }
        assert_eq!(jitter(base, 0), Duration::ZERO);
    }

    #[test]
    fn jitter_saturates_on_huge_bases() {
        let delay = jitter(Duration::MAX, 7);
        assert!(delay <= Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_success() {
        let sender = sender(0);
        let outcome = sender.send(&PeerMessage::Error { description: None }).await;
        assert_eq!(outcome, Delivery::Delivered);
        assert_eq!(sender.link().attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sender.state.snapshot().messages_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_delivered() {
        let sender = sender(6);
        let outcome = sender.send(&PeerMessage::Error { description: None }).await;
        assert_eq!(outcome, Delivery::Delivered);
        assert_eq!(sender.link().attempts.load(Ordering::SeqCst), 7);
        assert_eq!(sender.link().delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_after_attempt_ceiling() {
        let sender = sender(100);
        let outcome = sender.send(&PeerMessage::Error { description: None }).await;
        assert_eq!(outcome, Delivery::Dropped);
        assert_eq!(sender.link().attempts.load(Ordering::SeqCst), 7);
        assert_eq!(sender.state.snapshot().messages_dropped, 1);
    }
}
