//! Connection Lifecycle
//!
//! Single responsibility: own the transport, drive the state machine, and
//! reconnect with backoff until told to stop.
//!
//! # Reconnection Policy
//!
//! Every close (including a transport that fails to construct) schedules a
//! reconnect after the next delay of the backoff schedule. A successful open
//! resets the schedule. Reconnection never gives up; only [`close`] stops it.
//!
//! # Event Loop
//!
//! Transport events arrive on one channel and are handled one at a time by
//! the driver task ([`ConnectionManager::run`]). Events tagged with an older
//! epoch than the current transport are ignored.
//!
//! [`close`]: ConnectionManager::close

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::auth::AuthNegotiator;
use super::backoff::Backoff;
use super::client::ClientConfig;
use super::correlator::RequestCorrelator;
use super::lock;
use super::state::{ConnectionState, Credentials, Link, ReadyWaiters};
use super::transport::{CloseInfo, EventSink, TaggedEvent, Transport, TransportEvent};
use super::watchdog::watchdog;
use crate::error::ClientError;
use crate::time::TimeProvider;

pub struct ConnectionManager {
    endpoint: String,
    transport: Arc<dyn Transport>,
    time: Arc<dyn TimeProvider>,
    link: Arc<Link>,
    credentials: Arc<Mutex<Credentials>>,
    correlator: Arc<RequestCorrelator>,
    auth: AuthNegotiator,
    ready_waiters: Arc<ReadyWaiters>,
    backoff: Mutex<Backoff>,
    login_timeout: Duration,
    /// Set by `close()`; suppresses every further reconnect
    killed: AtomicBool,
    /// Bumped on every `connect()`
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<TaggedEvent>,
}

impl ConnectionManager {
    /// Build the manager and its components. Nothing is opened yet.
    pub(crate) fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        time: Arc<dyn TimeProvider>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TaggedEvent>) {
        let link = Arc::new(Link::new());
        let token = config
            .token
            .clone()
            .unwrap_or_else(|| time.unix_millis().to_string());
        let credentials = Arc::new(Mutex::new(Credentials::new(config.platform.clone(), token)));
        let ready_waiters = Arc::new(ReadyWaiters::default());

        let correlator = Arc::new(RequestCorrelator::new(
            Arc::clone(&link),
            Arc::clone(&time),
            config.request_timeout,
            config.retry_delay,
        ));
        let auth = AuthNegotiator::new(
            Arc::clone(&correlator),
            Arc::clone(&link),
            Arc::clone(&credentials),
            Arc::clone(&ready_waiters),
        );

        let (events, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            endpoint: config.endpoint.clone(),
            transport,
            time,
            link,
            credentials,
            correlator,
            auth,
            ready_waiters,
            backoff: Mutex::new(Backoff::new(config.reconnect_schedule.clone())),
            login_timeout: config.login_timeout,
            killed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            events,
        });

        (manager, events_rx)
    }

    /// Address for the next connect: endpoint followed by `<platform>_<token>`.
    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.endpoint, lock(&self.credentials).endpoint_suffix())
    }

    pub fn credentials(&self) -> Credentials {
        lock(&self.credentials).clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn time(&self) -> &Arc<dyn TimeProvider> {
        &self.time
    }

    pub fn is_closed_for_good(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Open a new transport with the current credentials.
    pub fn connect(self: &Arc<Self>) {
        if self.killed.load(Ordering::SeqCst) {
            debug!("Client closed; not connecting");
            return;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.set_state(ConnectionState::Connecting);

        let url = self.endpoint_url();
        info!(url = %url, epoch = epoch, "Connecting");

        match self
            .transport
            .open(&url, EventSink::new(epoch, self.events.clone()))
        {
            Ok(handle) => self.link.install(handle),
            Err(e) => {
                error!(url = %url, error = %e, "Transport could not be constructed");
                self.handle_close(None);
            }
        }
    }

    /// Driver loop. Runs until the event channel closes or the task is aborted.
    pub(crate) async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TaggedEvent>) {
        debug!("Connection driver started");

        while let Some((epoch, event)) = events.recv().await {
            let current = self.epoch.load(Ordering::SeqCst);
            if epoch != current {
                debug!(epoch = epoch, current = current, event = ?event, "Ignoring event from superseded transport");
                continue;
            }

            match event {
                TransportEvent::Open => self.handle_open(),
                TransportEvent::Message(raw) => {
                    if let Err(e) = self.correlator.on_message(&raw) {
                        warn!(error = %e, "Dropping inbound frame");
                    }
                }
                TransportEvent::Error(message) => {
                    error!(error = %message, "Transport error");
                }
                TransportEvent::Closed(info) => self.handle_close(info),
            }
        }

        debug!("Connection driver ended");
    }

    fn handle_open(self: &Arc<Self>) {
        if self.killed.load(Ordering::SeqCst) {
            debug!("Client closed; ignoring transport open");
            return;
        }

        lock(&self.backoff).reset();
        let epoch = self.epoch.load(Ordering::SeqCst);
        info!(epoch = epoch, "Transport open");

        // Auth replies arrive through this loop, so the exchange runs elsewhere
        let exchange = self.auth.negotiate(epoch);
        tokio::spawn(async move {
            // Failure is already logged by the negotiator
            let _ = exchange.await;
        });
    }

    fn handle_close(self: &Arc<Self>, info: Option<CloseInfo>) {
        match &info {
            Some(info) => warn!(code = info.code, reason = %info.reason, "Connection closed"),
            None => warn!("Connection closed"),
        }

        self.link.set_state(ConnectionState::Closed);

        if self.killed.load(Ordering::SeqCst) {
            info!("Client closed; not reconnecting");
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = lock(&self.backoff).next_delay();
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.time.sleep(delay).await;
            if this.epoch.load(Ordering::SeqCst) != epoch {
                debug!("Reconnect superseded");
                return;
            }
            this.connect();
        });
    }

    /// Run the login exchange on the current socket, or join the one
    /// already running on it.
    pub fn auth(&self) -> BoxFuture<'static, Result<(), ClientError>> {
        self.auth.negotiate(self.epoch.load(Ordering::SeqCst))
    }

    /// Switch identity and reconnect.
    ///
    /// The state is `closed` when this returns; the future settles on the
    /// next transition into `ready`, or with `Timeout` after the login
    /// timeout. Reconnect attempts continue after a timeout.
    pub fn login(
        &self,
        platform: impl Into<String>,
        token: impl Into<String>,
    ) -> BoxFuture<'static, Result<(), ClientError>> {
        let credentials = Credentials::new(platform, token);
        info!(platform = %credentials.platform, "Switching identity");
        *lock(&self.credentials) = credentials;

        let (ready_tx, ready_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(ready_tx)));
        let on_timeout = Arc::clone(&slot);
        self.ready_waiters.push(watchdog(
            Arc::clone(&self.time),
            move |()| {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(Ok(()));
                }
            },
            move |e| {
                if let Some(tx) = lock(&on_timeout).take() {
                    let _ = tx.send(Err(e));
                }
            },
            self.login_timeout,
        ));

        self.link.set_state(ConnectionState::Closed);
        self.link.close_transport();

        Box::pin(async move {
            ready_rx
                .await
                .unwrap_or_else(|_| Err(ClientError::Internal("Login waiter dropped".into())))
        })
    }

    /// Close the transport and never reconnect.
    pub fn close(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            info!("Closing connection");
        }
        self.link.close_transport();
    }
}
