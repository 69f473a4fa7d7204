//! One-Shot Timeout Guard
//!
//! Single responsibility: settle exactly once, either by an explicit trigger
//! or by a deadline.
//!
//! ```text
//!   watchdog(on_resolve, on_reject, timeout) ──► Trigger
//!
//!   trigger.fire(v) before deadline  → on_resolve(v), timer disarmed
//!   deadline before any fire         → on_reject(Timeout)
//!   anything after the first         → no-op
//! ```
//!
//! Pending requests, the auth exchange and `login` all rely on this
//! exactly-once property.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use super::lock;
use crate::error::ClientError;
use crate::time::TimeProvider;

/// Deadline used when a caller asks for a zero timeout.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(3000);

type OnResolve<T> = Box<dyn FnOnce(T) + Send>;
type OnReject = Box<dyn FnOnce(ClientError) + Send>;

struct Callbacks<T> {
    on_resolve: OnResolve<T>,
    on_reject: OnReject,
}

struct Inner<T> {
    /// `None` once settled
    callbacks: Mutex<Option<Callbacks<T>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    fn take(&self) -> Option<Callbacks<T>> {
        lock(&self.callbacks).take()
    }
}

/// Completion handle returned by [`watchdog`].
///
/// Cloning yields another handle to the same guard; whichever clone fires
/// first wins.
pub struct Trigger<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Trigger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Trigger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Trigger<T> {
    /// Settle the guard with `value`.
    ///
    /// Returns `true` if this call resolved it, `false` if it had already
    /// been settled (by an earlier fire or by the deadline).
    pub fn fire(&self, value: T) -> bool {
        let Some(callbacks) = self.inner.take() else {
            return false;
        };
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
        (callbacks.on_resolve)(value);
        true
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.inner.callbacks).is_none()
    }
}

/// Arm a one-shot guard.
///
/// `on_reject` receives [`ClientError::Timeout`] if `timeout` elapses before
/// the returned trigger fires. A zero timeout is replaced by
/// [`DEFAULT_WATCHDOG_TIMEOUT`].
///
/// Must be called from within a tokio runtime.
pub fn watchdog<T, R, J>(
    time: Arc<dyn TimeProvider>,
    on_resolve: R,
    on_reject: J,
    timeout: Duration,
) -> Trigger<T>
where
    T: Send + 'static,
    R: FnOnce(T) + Send + 'static,
    J: FnOnce(ClientError) + Send + 'static,
{
    let timeout = if timeout.is_zero() {
        DEFAULT_WATCHDOG_TIMEOUT
    } else {
        timeout
    };

    let inner = Arc::new(Inner {
        callbacks: Mutex::new(Some(Callbacks {
            on_resolve: Box::new(on_resolve),
            on_reject: Box::new(on_reject),
        })),
        timer: Mutex::new(None),
    });

    let expiring = Arc::clone(&inner);
    let timer = tokio::spawn(async move {
        time.sleep(timeout).await;
        if let Some(callbacks) = expiring.take() {
            trace!(timeout_ms = timeout.as_millis() as u64, "Watchdog expired");
            (callbacks.on_reject)(ClientError::Timeout);
        }
    });

    // The timer may already have finished on a multi-threaded runtime;
    // aborting a finished task later is harmless.
    *lock(&inner.timer) = Some(timer);

    Trigger { inner }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TokioTimeProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counters {
        resolved: Arc<AtomicUsize>,
        rejected: Arc<AtomicUsize>,
    }

    fn counted(timeout: Duration) -> (Trigger<u32>, Counters) {
        let resolved = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&resolved);
        let j = Arc::clone(&rejected);
        let trigger = watchdog(
            TokioTimeProvider::shared(),
            move |_: u32| {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move |e: ClientError| {
                assert!(e.is_timeout());
                j.fetch_add(1, Ordering::SeqCst);
            },
            timeout,
        );
        (trigger, Counters { resolved, rejected })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_before_deadline_resolves_once() {
        let (trigger, counters) = counted(Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(trigger.fire(7));
        assert!(!trigger.fire(8));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(counters.resolved.load(Ordering::SeqCst), 1);
        assert_eq!(counters.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_rejects_once() {
        let (trigger, counters) = counted(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(counters.rejected.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counters.rejected.load(Ordering::SeqCst), 1);

        // Late trigger is ignored
        assert!(!trigger.fire(1));
        assert_eq!(counters.resolved.load(Ordering::SeqCst), 0);
        assert!(trigger.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_uses_default() {
        let (_trigger, counters) = counted(Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(counters.rejected.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counters.rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_settlement() {
        let (trigger, counters) = counted(Duration::from_secs(1));
        let other = trigger.clone();

        assert!(other.fire(1));
        assert!(!trigger.fire(2));
        assert_eq!(counters.resolved.load(Ordering::SeqCst), 1);
    }
}
