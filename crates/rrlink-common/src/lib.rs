//! rrlink Common Types and Wire Layer
//!
//! This crate provides the protocol definitions, frame codec, request
//! signing and rate limiting shared by the rrlink client and CLI.
//!
//! # Overview
//!
//! A controller reaches a device over two channels: a cloud MQTT broker and
//! a direct TCP socket on the local network. Both carry the same encrypted
//! frames. The cloud REST API that issues credentials signs its requests
//! with a Hawk-style MAC and enforces per-account quotas.
//!
//! - **Protocol Layer**: Request/Response types, messages, error handling
//! - **Transport Layer**: Frame codec and payload ciphers
//! - **Auth**: REST request signing
//! - **Rate Limiting**: Multi-window quotas per operation category
//!
//! # Components
//!
//! - [`protocol`] - Core protocol types (Request, Response, Message, Error)
//! - [`transport`] - Frame codec and incremental decoder
//! - [`auth`] - Signing credential and `Authorization` header construction
//! - [`rate_limit`] - Rolling-window limiter
//!
//! # Example
//!
//! ```no_run
//! use rrlink_common::{Request, Response, Message};
//! use serde_json::json;
//!
//! let request = Request::new(1, "get_status", json!([]));
//! let message = Message::request(request.id, request);
//!
//! let response = Response::success(1, json!([{"state": 8}]));
//! ```

pub mod auth;
pub mod protocol;
pub mod rate_limit;
pub mod transport;

pub use protocol::*;
