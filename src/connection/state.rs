//! Shared connection state: lifecycle value, the live transport handle,
//! credentials and the ready-waiter queue.

use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::lock;
use super::transport::TransportHandle;
use super::watchdog::Trigger;
use crate::error::ClientError;

/// Connection lifecycle.
///
/// ```text
/// closed ──connect()──► connecting ──open──► login ──auth ok──► ready
///    ▲                                                            │
///    └──────────────────────── transport closed ◄─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Login,
    Ready,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Login => "login",
            ConnectionState::Ready => "ready",
        }
    }

    /// Whether the socket is open and can carry frames.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Login | ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity presented to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub platform: String,
    pub token: String,
}

impl Credentials {
    pub fn new(platform: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            token: token.into(),
        }
    }

    /// `<platform>_<token>`, appended to the endpoint on every connect.
    pub fn endpoint_suffix(&self) -> String {
        format!("{}_{}", self.platform, self.token)
    }
}

/// The one live transport and the state it is in.
pub(crate) struct Link {
    state: watch::Sender<ConnectionState>,
    handle: Mutex<Option<Box<dyn TransportHandle>>>,
}

impl Link {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            state,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Replace the transport handle. The previous one is dropped.
    pub(crate) fn install(&self, handle: Box<dyn TransportHandle>) {
        *lock(&self.handle) = Some(handle);
    }

    /// Hand a frame to the transport. Fails with `ConnectionFailed` unless
    /// the socket has opened.
    pub(crate) fn transmit(&self, frame: String) -> Result<(), ClientError> {
        if !self.state().is_open() {
            return Err(ClientError::ConnectionFailed);
        }
        let guard = lock(&self.handle);
        let handle = guard.as_ref().ok_or(ClientError::ConnectionFailed)?;
        handle.send(frame)
    }

    pub(crate) fn close_transport(&self) {
        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.close();
        }
    }
}

/// Callbacks waiting for the next transition into `ready`.
#[derive(Default)]
pub(crate) struct ReadyWaiters {
    waiters: Mutex<Vec<Trigger<()>>>,
}

impl ReadyWaiters {
    /// Queue a waiter, dropping any that already timed out.
    pub(crate) fn push(&self, waiter: Trigger<()>) {
        let mut waiters = lock(&self.waiters);
        waiters.retain(|w| !w.is_settled());
        waiters.push(waiter);
    }

    /// Fire every queued waiter, most recently queued first.
    pub(crate) fn drain(&self) {
        let waiters = std::mem::take(&mut *lock(&self.waiters));
        for waiter in waiters.into_iter().rev() {
            waiter.fire(());
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.waiters).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Login.to_string(), "login");
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }

    #[test]
    fn test_endpoint_suffix() {
        assert_eq!(Credentials::new("alice", "42").endpoint_suffix(), "alice_42");
    }

    #[test]
    fn test_transmit_requires_open_socket() {
        let link = Link::new();
        assert!(matches!(
            link.transmit("1:p::1:{}".into()),
            Err(ClientError::ConnectionFailed)
        ));

        // Open state but no handle installed
        link.set_state(ConnectionState::Login);
        assert!(matches!(
            link.transmit("1:p::1:{}".into()),
            Err(ClientError::ConnectionFailed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_drain_most_recent_first() {
        use crate::connection::watchdog::watchdog;
        use crate::time::TokioTimeProvider;
        use std::time::Duration;

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let waiters = ReadyWaiters::default();
        for n in 1..=3 {
            let order = std::sync::Arc::clone(&order);
            waiters.push(watchdog(
                TokioTimeProvider::shared(),
                move |()| order.lock().unwrap().push(n),
                |_| {},
                Duration::from_secs(5),
            ));
        }
        assert_eq!(waiters.len(), 3);

        waiters.drain();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(waiters.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_waiters_pruned_on_push() {
        use crate::connection::watchdog::watchdog;
        use crate::time::TokioTimeProvider;
        use std::time::Duration;

        let waiters = ReadyWaiters::default();
        for _ in 0..3 {
            waiters.push(watchdog(
                TokioTimeProvider::shared(),
                |()| {},
                |_| {},
                Duration::from_millis(100),
            ));
        }
        assert_eq!(waiters.len(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        waiters.push(watchdog(
            TokioTimeProvider::shared(),
            |()| {},
            |_| {},
            Duration::from_secs(5),
        ));
        assert_eq!(waiters.len(), 1);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let link = Link::new();
        let rx = link.subscribe();
        link.set_state(ConnectionState::Connecting);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert_eq!(link.state(), ConnectionState::Connecting);
    }
}
