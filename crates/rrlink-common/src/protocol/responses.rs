//! Device Response Types
//!
//! This module defines the RPC response structure returned by devices.

use serde::{Deserialize, Serialize};
use super::RequestId;

/// Payload of a successful device answer.
pub type RpcResult = serde_json::Value;

/// A device answer to a [`Request`](super::Request), travelling in an RPC
/// response frame.
///
/// Exactly one of `result` and `error` is normally set. Devices report
/// failures as an object such as `{"code": -10005, "message": ".."}`.
///
/// # Example
///
/// ```
/// use rrlink_common::protocol::responses::Response;
/// use serde_json::json;
///
/// let ok = Response::success(7, json!(["ok"]));
/// assert!(ok.is_success());
///
/// let failed = Response::error(7, json!({"code": -10005, "message": "unknown method"}));
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Id of the request being answered
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl Response {
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: serde_json::Value) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns whether the device reported success.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
