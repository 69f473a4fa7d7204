//! Client with Automatic Reconnection
//!
//! Single responsibility: the public surface over the connection components.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Client                          │
//! │  - send() / login() / auth() / close() / state()        │
//! │  - owns the driver task                                 │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                  ConnectionManager                     │
//! │  - state machine, reconnect with backoff                │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!           Transport   Correlator   AuthNegotiator
//!                            │
//!                            ▼
//!                        Watchdog
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let client = Client::connect(ClientConfig {
//!     endpoint: "ws://localhost:5010/".to_string(),
//!     ..Default::default()
//! });
//!
//! let result = client.send("echo", json!({"x": 1})).await?;
//! client.login("alice", "42").await?;
//! ```

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::backoff::DEFAULT_RECONNECT_SCHEDULE_SECS;
use super::correlator::{Response, RetryBudget, SendOptions, DEFAULT_RETRY_DELAY};
use super::manager::ConnectionManager;
use super::state::{ConnectionState, Credentials};
use super::transport::{Transport, WsTransport};
use super::watchdog::{watchdog, Trigger};
use crate::error::ClientError;
use crate::time::{TimeProvider, TokioTimeProvider};

/// Runtime configuration for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint prefix; `<platform>_<token>` is appended on every connect
    pub endpoint: String,
    pub platform: String,
    /// `None` uses the current unix time in milliseconds
    pub token: Option<String>,
    /// Default watchdog for each request
    pub request_timeout: Duration,
    /// Retry budget used by [`Client::send`]
    pub retry_budget: RetryBudget,
    pub retry_delay: Duration,
    /// How long `login()` waits for the next `ready`
    pub login_timeout: Duration,
    pub reconnect_schedule: Vec<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:5010/".to_string(),
            platform: "guest".to_string(),
            token: None,
            request_timeout: Duration::from_millis(5000),
            retry_budget: RetryBudget::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            login_timeout: Duration::from_millis(5000),
            reconnect_schedule: DEFAULT_RECONNECT_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

/// A persistent connection that looks like a request/response channel.
///
/// Construction starts connecting immediately and must happen inside a tokio
/// runtime. Dropping the client closes the connection for good.
pub struct Client {
    manager: Arc<ConnectionManager>,
    retry_budget: RetryBudget,
    driver: JoinHandle<()>,
}

impl Client {
    /// Connect over WebSocket with the real clock.
    pub fn connect(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(WsTransport::new()), TokioTimeProvider::shared())
    }

    /// Connect with an explicit transport and time provider.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        info!(endpoint = %config.endpoint, platform = %config.platform, "Creating client");

        let (manager, events) = ConnectionManager::new(&config, transport, time);
        let driver = tokio::spawn(Arc::clone(&manager).run(events));
        manager.connect();

        Self {
            manager,
            retry_budget: config.retry_budget,
            driver,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    /// Wait until the connection is `ready`, however long that takes.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut states = self.manager.subscribe_state();
        states
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Internal("State channel closed".into()))
    }

    /// Issue a request with the configured retry budget.
    pub fn send(&self, path: &str, payload: Value) -> Response {
        self.send_with(path, payload, SendOptions::with_retry(self.retry_budget))
    }

    /// Issue a request with an explicit retry budget.
    pub fn send_with_retry(&self, path: &str, payload: Value, retry: impl Into<RetryBudget>) -> Response {
        self.send_with(path, payload, SendOptions::with_retry(retry.into()))
    }

    pub fn send_with(&self, path: &str, payload: Value, options: SendOptions) -> Response {
        self.manager.correlator().send(path, payload, options)
    }

    /// Run the login exchange on the current socket. Joins the exchange
    /// already in flight on this socket, if any.
    pub fn auth(&self) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        self.manager.auth()
    }

    /// Re-authenticate as a different identity on the same client.
    ///
    /// The state is `closed` as soon as this returns.
    pub fn login(
        &self,
        platform: impl Into<String>,
        token: impl Into<String>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        self.manager.login(platform, token)
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        self.manager.close();
    }

    /// Arm a one-shot timeout guard on this client's clock.
    pub fn watchdog<T, R, J>(&self, on_resolve: R, on_reject: J, timeout: Duration) -> Trigger<T>
    where
        T: Send + 'static,
        R: FnOnce(T) + Send + 'static,
        J: FnOnce(ClientError) + Send + 'static,
    {
        watchdog(Arc::clone(self.manager.time()), on_resolve, on_reject, timeout)
    }

    pub fn endpoint_url(&self) -> String {
        self.manager.endpoint_url()
    }

    pub fn credentials(&self) -> Credentials {
        self.manager.credentials()
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.manager.correlator().pending_requests()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.manager.close();
        self.driver.abort();
    }
}
