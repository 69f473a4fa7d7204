//! Connection Authentication
//!
//! Single responsibility: run the login exchange on a freshly opened socket
//! and promote the connection to `ready` when it succeeds.
//!
//! # Authentication Flow
//!
//! 1. Transport reports open; state becomes `login`
//! 2. Send `auth/<platform>` with the credential token, bypassing the
//!    not-ready retry queue (the socket is open, the connection is not ready
//!    yet by definition)
//! 3. On an `ok` reply: state becomes `ready` and every ready-waiter fires
//! 4. On failure or timeout: log it and leave the state at `login`. The
//!    server is expected to drop a rejected socket, and the close restarts
//!    the cycle.
//!
//! At most one exchange runs per connection attempt; a second request for
//! the same epoch shares the outcome of the first.
//!
//! The token is also part of the endpoint address, which is where the server
//! reads it from; the request body goes through the usual payload
//! normalization.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use super::correlator::{RequestCorrelator, RetryBudget, SendOptions};
use super::lock;
use super::state::{ConnectionState, Credentials, Link, ReadyWaiters};
use crate::error::ClientError;

type Exchange = Shared<BoxFuture<'static, Result<(), ClientError>>>;

/// The exchange currently running and the connection epoch it belongs to.
struct InFlight {
    epoch: u64,
    exchange: Exchange,
}

pub struct AuthNegotiator {
    correlator: Arc<RequestCorrelator>,
    link: Arc<Link>,
    credentials: Arc<Mutex<Credentials>>,
    ready_waiters: Arc<ReadyWaiters>,
    in_flight: Mutex<Option<InFlight>>,
}

impl AuthNegotiator {
    pub(crate) fn new(
        correlator: Arc<RequestCorrelator>,
        link: Arc<Link>,
        credentials: Arc<Mutex<Credentials>>,
        ready_waiters: Arc<ReadyWaiters>,
    ) -> Self {
        Self {
            correlator,
            link,
            credentials,
            ready_waiters,
            in_flight: Mutex::new(None),
        }
    }

    /// Start the login exchange for the connection with the given epoch.
    ///
    /// The state moves to `login` and the auth frame is transmitted before
    /// this returns. While an exchange for the same epoch is unsettled, later
    /// calls join it instead of sending another frame. The future settles
    /// with the outcome of the exchange.
    pub fn negotiate(&self, epoch: u64) -> BoxFuture<'static, Result<(), ClientError>> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(current) = in_flight.as_ref() {
            if current.epoch == epoch && current.exchange.peek().is_none() {
                debug!(epoch = epoch, "Joining authentication already in flight");
                return current.exchange.clone().boxed();
            }
        }

        let exchange = self.start().shared();
        *in_flight = Some(InFlight {
            epoch,
            exchange: exchange.clone(),
        });
        exchange.boxed()
    }

    fn start(&self) -> BoxFuture<'static, Result<(), ClientError>> {
        self.link.set_state(ConnectionState::Login);

        let credentials = lock(&self.credentials).clone();
        let path = format!("auth/{}", credentials.platform);
        debug!(platform = %credentials.platform, "Authenticating connection");

        let reply = self.correlator.send(
            &path,
            Value::String(credentials.token),
            SendOptions::with_retry(RetryBudget::Bypass),
        );

        let link = Arc::clone(&self.link);
        let ready_waiters = Arc::clone(&self.ready_waiters);
        let platform = credentials.platform;

        Box::pin(async move {
            match reply.await {
                Ok(_) => {
                    if link.state() != ConnectionState::Login {
                        // Socket went away while the reply was in flight
                        debug!(state = %link.state(), "Ignoring late authentication success");
                        return Ok(());
                    }
                    link.set_state(ConnectionState::Ready);
                    info!(platform = %platform, "Connection ready");
                    ready_waiters.drain();
                    Ok(())
                }
                Err(e) => {
                    error!(platform = %platform, error = %e, "Authentication failed");
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::correlator::DEFAULT_RETRY_DELAY;
    use crate::connection::transport::TransportHandle;
    use crate::connection::watchdog::watchdog;
    use crate::time::TokioTimeProvider;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<String>>>,
    }

    impl TransportHandle for Recorder {
        fn send(&self, frame: String) -> Result<(), ClientError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&self) {}
    }

    fn negotiator() -> (AuthNegotiator, Arc<RequestCorrelator>, Arc<Link>, Recorder, Arc<ReadyWaiters>) {
        let link = Arc::new(Link::new());
        let recorder = Recorder::default();
        link.install(Box::new(recorder.clone()));
        link.set_state(ConnectionState::Connecting);
        let correlator = Arc::new(RequestCorrelator::new(
            Arc::clone(&link),
            TokioTimeProvider::shared(),
            Duration::from_secs(3),
            DEFAULT_RETRY_DELAY,
        ));
        let waiters = Arc::new(ReadyWaiters::default());
        let auth = AuthNegotiator::new(
            Arc::clone(&correlator),
            Arc::clone(&link),
            Arc::new(Mutex::new(Credentials::new("guest", "1700000000000"))),
            Arc::clone(&waiters),
        );
        (auth, correlator, link, recorder, waiters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_promotes_to_ready_and_drains_waiters() {
        let (auth, correlator, link, recorder, waiters) = negotiator();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        waiters.push(watchdog(
            TokioTimeProvider::shared(),
            move |()| flag.store(true, Ordering::SeqCst),
            |_| {},
            Duration::from_secs(5),
        ));

        let outcome = auth.negotiate(1);
        assert_eq!(link.state(), ConnectionState::Login);

        let frame = recorder.frames.lock().unwrap()[0].clone();
        assert!(frame.contains(":auth/guest::1:{}"), "unexpected frame {}", frame);

        correlator.on_message("1:auth/guest::1:ok").unwrap();
        outcome.await.unwrap();

        assert_eq!(link.state(), ConnectionState::Ready);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(waiters.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_state_at_login() {
        let (auth, correlator, link, _recorder, _waiters) = negotiator();

        let outcome = auth.negotiate(1);
        correlator
            .on_message(r#"1:auth/guest::1:failed {"error":"bad token"}"#)
            .unwrap();

        assert!(matches!(outcome.await, Err(ClientError::RemoteFailure(_))));
        assert_eq!(link.state(), ConnectionState::Login);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_auth_times_out() {
        let (auth, _correlator, link, _recorder, _waiters) = negotiator();

        assert!(matches!(auth.negotiate(1).await, Err(ClientError::Timeout)));
        assert_eq!(link.state(), ConnectionState::Login);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_joins_exchange_in_flight() {
        let (auth, correlator, link, recorder, _waiters) = negotiator();

        let first = auth.negotiate(1);
        let second = auth.negotiate(1);
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);

        correlator.on_message("1:auth/guest::1:ok").unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(link.state(), ConnectionState::Ready);
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_epoch_or_settled_exchange_starts_over() {
        let (auth, correlator, _link, recorder, _waiters) = negotiator();

        let first = auth.negotiate(1);
        let other_socket = auth.negotiate(2);
        assert_eq!(recorder.frames.lock().unwrap().len(), 2);

        correlator.on_message("1:auth/guest::1:ok").unwrap();
        first.await.unwrap();

        let joined = auth.negotiate(2);
        assert_eq!(recorder.frames.lock().unwrap().len(), 2);

        correlator.on_message("1:auth/guest::2:ok").unwrap();
        other_socket.await.unwrap();
        joined.await.unwrap();

        let _fresh = auth.negotiate(2);
        assert_eq!(recorder.frames.lock().unwrap().len(), 3);
    }
}
