//! Tether - persistent request/response client over an unreliable socket
//!
//! Callers issue named requests and get one eventual result each. The client
//! takes care of authenticating after every connect, reconnecting with
//! backoff, and timing out requests that never get a reply.
//!
//! ## Lifecycle
//!
//! ```text
//! closed ─► connecting ─► login ─► ready
//!   ▲                                │
//!   └──────── transport closed ◄─────┘   (reconnect after 0,1,2,4,7,11,16,16,... s)
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! out: <unixMillis>:<path>::<id>:<json>
//! in:  <unixMillis>:<path>:<marker>:<id>:ok|failed [json]
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod time;

// Re-exports
pub use config::Config;
pub use connection::{
    Client, ClientConfig, ConnectionState, Credentials, RetryBudget, SendOptions, Trigger,
};
pub use error::ClientError;
pub use time::{TimeProvider, TokioTimeProvider};
