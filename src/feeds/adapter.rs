//! Shared reconnect/backoff runner for exchange adapters.
//!
//! Each adapter owns one upstream transport (WebSocket or polled REST) and
//! emits `PriceSample`s into the aggregator intake. The runner reconnects
//! on transport failure with `min(initial * 2^attempts, max)` delays; the
//! attempt counter resets once a connection succeeds, and after the cap the
//! adapter goes inert with a single final log line.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::models::PriceSample;

/// How one `run_once` call ended.
#[derive(Debug)]
pub enum AdapterExit {
    /// Upstream closed the connection normally, or the intake went away.
    CleanClose,
    /// Could not establish the connection at all.
    ConnectFailed(anyhow::Error),
    /// Connected, then the stream died.
    StreamFailed(anyhow::Error),
}

#[async_trait]
pub trait FeedAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Connect and pump samples until the transport ends one way or another.
    async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.min(20);
        self.initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max)
    }
}

pub fn spawn_adapter(
    adapter: Arc<dyn FeedAdapter>,
    out: mpsc::Sender<PriceSample>,
    policy: BackoffPolicy,
) {
    tokio::spawn(async move {
        run_adapter(adapter, out, policy).await;
    });
}

pub async fn run_adapter(
    adapter: Arc<dyn FeedAdapter>,
    out: mpsc::Sender<PriceSample>,
    policy: BackoffPolicy,
) {
    let mut attempts: u32 = 0;

    loop {
        if out.is_closed() {
            return;
        }
        match adapter.run_once(&out).await {
            AdapterExit::CleanClose => {
                attempts = 0;
                debug!(source = adapter.name(), "feed closed; reconnecting");
            }
            AdapterExit::StreamFailed(e) => {
                // The connection had succeeded, so the counter starts over.
                attempts = 0;
                warn!(source = adapter.name(), error = %e, "feed stream failed; reconnecting");
            }
            AdapterExit::ConnectFailed(e) => {
                attempts += 1;
                warn!(
                    source = adapter.name(),
                    attempts,
                    error = %e,
                    "feed connect failed"
                );
                if attempts >= policy.max_attempts {
                    error!(source = adapter.name(), "max reconnect attempts reached");
                    return;
                }
            }
        }
        tokio::time::sleep(policy.delay_for(attempts)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(30), Duration::from_secs(2));
    }

    struct AlwaysFailing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeedAdapter for AlwaysFailing {
        fn name(&self) -> &'static str {
            "always-failing"
        }

        async fn run_once(&self, _out: &mpsc::Sender<PriceSample>) -> AdapterExit {
            self.calls.fetch_add(1, Ordering::Relaxed);
            AdapterExit::ConnectFailed(anyhow::anyhow!("refused"))
        }
    }

    #[tokio::test]
    async fn test_runner_goes_inert_after_cap() {
        let adapter = Arc::new(AlwaysFailing {
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(8);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_attempts: 3,
        };
        run_adapter(adapter.clone(), tx, policy).await;
        assert_eq!(adapter.calls.load(Ordering::Relaxed), 3);
    }

    struct FlakyThenClean {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeedAdapter for FlakyThenClean {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run_once(&self, out: &mpsc::Sender<PriceSample>) -> AdapterExit {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if n < 2 {
                AdapterExit::ConnectFailed(anyhow::anyhow!("refused"))
            } else {
                // Connected once: drop the intake so the runner stops.
                let _ = out;
                AdapterExit::StreamFailed(anyhow::anyhow!("eof"))
            }
        }
    }

    #[tokio::test]
    async fn test_success_resets_attempt_counter() {
        let adapter = Arc::new(FlakyThenClean {
            calls: AtomicU32::new(0),
        });
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_attempts: 3,
        };
        // Two connect failures, then a stream failure that resets the
        // counter, then the closed intake ends the loop. Were the counter
        // not reset, the third failure would have hit the cap before the
        // stream ever ran.
        run_adapter(adapter.clone(), tx, policy).await;
        assert_eq!(adapter.calls.load(Ordering::Relaxed), 3);
    }
}
