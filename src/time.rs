//! Time provider abstraction
//!
//! Every delay in the client (watchdog deadlines, send retries, reconnect
//! backoff) and every frame timestamp goes through a [`TimeProvider`], so a
//! test can drive the whole connection lifecycle on a virtual clock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Scheduling capability injected into the client.
#[async_trait]
pub trait TimeProvider: Send + Sync + 'static {
    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Wall-clock time in milliseconds since the unix epoch.
    ///
    /// Used for the timestamp field of outbound frames and for the default
    /// credential token.
    fn unix_millis(&self) -> u64;
}

/// Real time provider backed by tokio timers and the system clock.
#[derive(Debug, Clone, Default)]
pub struct TokioTimeProvider;

impl TokioTimeProvider {
    pub fn new() -> Self {
        Self
    }

    /// Convenience for the common `Arc<dyn TimeProvider>` form.
    pub fn shared() -> Arc<dyn TimeProvider> {
        Arc::new(Self)
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn unix_millis(&self) -> u64 {
        // Before 1970 only on a broken clock
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(TokioTimeProvider::new().unix_millis() > 1_577_836_800_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_follows_tokio_clock() {
        let start = tokio::time::Instant::now();
        TokioTimeProvider::new().sleep(Duration::from_secs(3)).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
