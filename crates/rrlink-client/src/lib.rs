//! rrlink Client
//!
//! Device sessions over the cloud broker or the local socket, the command
//! dispatcher correlating responses to requests, and the cloud REST client.
//!
//! - [`transport`] - [`Transport`](transport::Transport) trait, broker and local implementations
//! - [`DeviceSession`] - Per-device identity and request id allocation
//! - [`Dispatcher`] - Request/response correlation with timeouts
//! - [`WebApiClient`] - Signed, rate-limited REST calls

pub mod dispatcher;
pub mod session;
pub mod transport;
pub mod web_api;

pub use dispatcher::{Dispatcher, DispatcherConfig, UnsolicitedSink};
pub use session::DeviceSession;
pub use transport::{MessageSink, Subscription, Transport};
pub use web_api::{HomeDataVersion, UserData, WebApiClient};
