//! Request Correlation
//!
//! Single responsibility: give every request an id, put it on the wire, and
//! route the matching reply back to the caller.
//!
//! ```text
//!  send(path, payload)
//!     │  not ready? ── retry loop (sleep retry_delay, budget - 1) ──► ConnectionFailed
//!     ▼
//!  id = next_id++ ──► pending[id] = Watchdog ──► transport.send(frame)
//!
//!  on_message(frame) ──► pending.remove(id) ──► trigger.fire(result)
//! ```
//!
//! The pending entry exists before the frame is handed to the transport, so a
//! reply is routed correctly no matter how early it arrives. Entries leave the
//! registry on reply or on watchdog expiry, whichever is first. A transport
//! close does not fail outstanding requests; they run out their own timeout.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::frame::{decode_reply, encode_request};
use super::lock;
use super::state::Link;
use super::watchdog::{watchdog, Trigger};
use crate::error::ClientError;
use crate::time::TimeProvider;

/// Retries a send gets by default while the connection is not ready.
pub const DEFAULT_RETRY_BUDGET: u32 = 4;

/// Delay between send retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long a send may wait for the connection to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// Skip the readiness check entirely (used mid-handshake by auth).
    Bypass,
    /// Retry up to this many times, `retry_delay` apart.
    Attempts(u32),
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Attempts(DEFAULT_RETRY_BUDGET)
    }
}

impl From<i32> for RetryBudget {
    /// `-1` is the bypass sentinel; other negatives mean no retries.
    fn from(value: i32) -> Self {
        match value {
            -1 => RetryBudget::Bypass,
            n => RetryBudget::Attempts(u32::try_from(n).unwrap_or(0)),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub retry: RetryBudget,
    /// Falls back to the client's request timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn with_retry(retry: RetryBudget) -> Self {
        Self {
            retry,
            timeout: None,
        }
    }
}

/// Eventual result of a request.
pub type Response = BoxFuture<'static, Result<Value, ClientError>>;

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Result<Value, ClientError>>>>>;

struct PendingRequest {
    trigger: Trigger<Result<Value, ClientError>>,
    path: String,
    sent_at: u64,
}

pub struct RequestCorrelator {
    link: Arc<Link>,
    time: Arc<dyn TimeProvider>,
    /// Never reset, so ids stay unique across reconnects
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, PendingRequest>>,
    request_timeout: Duration,
    retry_delay: Duration,
}

impl RequestCorrelator {
    pub(crate) fn new(
        link: Arc<Link>,
        time: Arc<dyn TimeProvider>,
        request_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            link,
            time,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            request_timeout,
            retry_delay,
        }
    }

    /// Issue a request.
    ///
    /// When the connection is ready (or the budget is `Bypass`) the frame is
    /// transmitted before this returns; otherwise the returned future runs
    /// the retry loop first.
    pub fn send(self: &Arc<Self>, path: &str, payload: Value, options: SendOptions) -> Response {
        let timeout = options.timeout.unwrap_or(self.request_timeout);

        if options.retry == RetryBudget::Bypass || self.link.is_ready() {
            let reply = self.dispatch(path, payload, timeout);
            return Box::pin(await_reply(reply));
        }

        let this = Arc::clone(self);
        let path = path.to_string();
        Box::pin(async move {
            this.wait_until_ready(&path, options.retry).await?;
            let reply = this.dispatch(&path, payload, timeout);
            await_reply(reply).await
        })
    }

    /// Retry loop for sends issued while not ready.
    async fn wait_until_ready(&self, path: &str, budget: RetryBudget) -> Result<(), ClientError> {
        let mut remaining = match budget {
            RetryBudget::Bypass => return Ok(()),
            RetryBudget::Attempts(n) => n,
        };

        while !self.link.is_ready() {
            if remaining == 0 {
                debug!(path = %path, "Retry budget exhausted");
                return Err(ClientError::ConnectionFailed);
            }
            remaining -= 1;
            debug!(
                path = %path,
                remaining = remaining,
                state = %self.link.state(),
                "Connection not ready, retrying send"
            );
            self.time.sleep(self.retry_delay).await;
        }
        Ok(())
    }

    /// Allocate an id, register the pending entry and transmit.
    fn dispatch(
        &self,
        path: &str,
        payload: Value,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Value, ClientError>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sent_at = self.time.unix_millis();
        let (reply_tx, reply_rx) = oneshot::channel();

        let frame = match encode_request(sent_at, path, id, payload) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply_tx.send(Err(e));
                return reply_rx;
            }
        };

        let slot: ReplySlot = Arc::new(Mutex::new(Some(reply_tx)));
        let on_reply = Arc::clone(&slot);
        let registry = Arc::clone(&self.pending);
        let trigger = watchdog(
            Arc::clone(&self.time),
            move |result| deliver(&on_reply, result),
            move |err| {
                registry.remove(&id);
                deliver(&slot, Err(err));
            },
            timeout,
        );

        self.pending.insert(
            id,
            PendingRequest {
                trigger: trigger.clone(),
                path: path.to_string(),
                sent_at,
            },
        );
        // Expired between arming and insert
        if trigger.is_settled() {
            self.pending.remove(&id);
        }

        debug!(id = id, path = %path, "Sending request");

        if let Err(e) = self.link.transmit(frame) {
            warn!(id = id, path = %path, error = %e, "Request could not be transmitted");
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.trigger.fire(Err(e));
            }
        }

        reply_rx
    }

    /// Route an inbound frame to its pending request.
    ///
    /// Frames for unknown ids (late replies after a timeout, duplicates) are
    /// dropped. Malformed frames are returned as `ClientError::Frame`.
    pub fn on_message(&self, raw: &str) -> Result<(), ClientError> {
        let reply = decode_reply(raw)?;

        match self.pending.remove(&reply.id) {
            Some((id, entry)) => {
                debug!(
                    id = id,
                    path = %entry.path,
                    status = ?reply.status,
                    sent_at = entry.sent_at,
                    server_ts = reply.timestamp,
                    "Routing reply"
                );
                entry.trigger.fire(reply.into_result());
            }
            None => {
                debug!(id = reply.id, "Dropping reply with no pending request");
            }
        }
        Ok(())
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Id the next request will get.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

fn deliver(slot: &ReplySlot, result: Result<Value, ClientError>) {
    if let Some(tx) = lock(slot).take() {
        let _ = tx.send(result);
    }
}

async fn await_reply(
    reply: oneshot::Receiver<Result<Value, ClientError>>,
) -> Result<Value, ClientError> {
    reply
        .await
        .unwrap_or_else(|_| Err(ClientError::Internal("Response channel closed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::state::ConnectionState;
    use crate::connection::transport::TransportHandle;
    use crate::time::TokioTimeProvider;
    use serde_json::json;

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

    fn ready_correlator() -> (Arc<RequestCorrelator>, Arc<Link>, Recorder) {
        let link = Arc::new(Link::new());
        let recorder = Recorder::default();
        link.install(Box::new(recorder.clone()));
        link.set_state(ConnectionState::Ready);
        let correlator = Arc::new(RequestCorrelator::new(
            Arc::clone(&link),
            TokioTimeProvider::shared(),
            Duration::from_secs(5),
            DEFAULT_RETRY_DELAY,
        ));
        (correlator, link, recorder)
    }

    fn frame_id(frame: &str) -> u64 {
        frame.split(':').nth(3).unwrap().parse().unwrap()
    }

    #[test]
    fn test_retry_budget_from_sentinel() {
        assert_eq!(RetryBudget::from(-1), RetryBudget::Bypass);
        assert_eq!(RetryBudget::from(-5), RetryBudget::Attempts(0));
        assert_eq!(RetryBudget::from(3), RetryBudget::Attempts(3));
        assert_eq!(RetryBudget::default(), RetryBudget::Attempts(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_routed_by_id_out_of_order() {
        let (correlator, _link, recorder) = ready_correlator();

        let first = correlator.send("a", json!({"n": 1}), SendOptions::default());
        let second = correlator.send("b", json!({"n": 2}), SendOptions::default());

        let frames = recorder.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        let (id_a, id_b) = (frame_id(&frames[0]), frame_id(&frames[1]));
        assert!(id_b > id_a);

        correlator
            .on_message(&format!(r#"1:b::{}:ok {{"got":"b"}}"#, id_b))
            .unwrap();
        correlator
            .on_message(&format!(r#"1:a::{}:ok {{"got":"a"}}"#, id_a))
            .unwrap();

        assert_eq!(first.await.unwrap(), json!({"got": "a"}));
        assert_eq!(second.await.unwrap(), json!({"got": "b"}));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_reply_is_dropped() {
        let (correlator, _link, recorder) = ready_correlator();

        let reply = correlator.send(
            "slow",
            json!({}),
            SendOptions {
                retry: RetryBudget::default(),
                timeout: Some(Duration::from_millis(100)),
            },
        );
        let id = frame_id(&recorder.frames.lock().unwrap()[0]);

        assert!(matches!(reply.await, Err(ClientError::Timeout)));
        assert_eq!(correlator.pending_requests(), 0);

        correlator.on_message(&format!("1:slow::{}:ok", id)).unwrap();
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_an_error() {
        let (correlator, _link, _recorder) = ready_correlator();
        let _pending = correlator.send("p", json!({}), SendOptions::default());

        assert!(matches!(
            correlator.on_message("garbage"),
            Err(ClientError::Frame(_))
        ));
        assert_eq!(correlator.pending_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_keep_increasing() {
        let (correlator, link, recorder) = ready_correlator();

        let _a = correlator.send("p", json!({}), SendOptions::default());
        link.set_state(ConnectionState::Closed);
        link.set_state(ConnectionState::Ready);
        let _b = correlator.send("p", json!({}), SendOptions::default());

        let frames = recorder.frames.lock().unwrap().clone();
        assert_eq!(frame_id(&frames[0]), 1);
        assert_eq!(frame_id(&frames[1]), 2);
        assert_eq!(correlator.peek_next_id(), 3);
    }
}
