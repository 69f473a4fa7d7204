//! Persistent Connection Module
//!
//! # Architecture
//!
//! Each submodule has a single responsibility:
//!
//! | Module       | Responsibility                                       |
//! |--------------|------------------------------------------------------|
//! | `watchdog`   | One-shot timeout guard, settles exactly once         |
//! | `frame`      | Text wire format, outbound encode / inbound decode   |
//! | `backoff`    | Reconnect delay schedule                             |
//! | `transport`  | Socket open/send/close and its event stream          |
//! | `state`      | Lifecycle state, live transport handle, credentials  |
//! | `correlator` | Request ids, pending registry, retry-on-not-ready    |
//! | `auth`       | Login exchange after every open                      |
//! | `manager`    | State machine and reconnection                       |
//! | `client`     | Public surface                                       |
//!
//! # Key Design Principles
//!
//! ## 1. Exactly-Once Settlement
//!
//! Every result a caller waits on is guarded by a watchdog. A reply, a
//! timeout or a transmit failure settles it; whichever is first wins and the
//! rest are no-ops.
//!
//! ## 2. One Event Loop
//!
//! Transport events are handled serially by a single driver task. Timers are
//! separate tasks that only touch shared state through short critical
//! sections.
//!
//! ## 3. Injectable Time
//!
//! Every delay goes through [`crate::time::TimeProvider`], so tests run the
//! full lifecycle on tokio's paused clock.

use std::sync::{Mutex, MutexGuard};

mod auth;
mod backoff;
mod client;
mod correlator;
mod frame;
mod manager;
mod state;
mod transport;
mod watchdog;

pub use auth::AuthNegotiator;
pub use backoff::{Backoff, DEFAULT_RECONNECT_SCHEDULE_SECS};
pub use client::{Client, ClientConfig};
pub use correlator::{
    RequestCorrelator, Response, RetryBudget, SendOptions, DEFAULT_RETRY_BUDGET,
    DEFAULT_RETRY_DELAY,
};
pub use frame::{decode_reply, encode_request, normalize_payload, Reply, ReplyStatus};
pub use manager::ConnectionManager;
pub use state::{ConnectionState, Credentials};
pub use transport::{
    CloseInfo, EventSink, Transport, TransportEvent, TransportHandle, WsTransport,
    DEFAULT_CLOSE_TIMEOUT,
};
pub use watchdog::{watchdog, Trigger, DEFAULT_WATCHDOG_TIMEOUT};

/// Lock a mutex, recovering the data if a holder panicked.
///
/// Callbacks never run while one of these locks is held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
