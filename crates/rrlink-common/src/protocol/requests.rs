use serde::{Deserialize, Serialize};

pub type RequestId = u32;
pub type MethodName = String;
pub type RpcParams = serde_json::Value;

/// A command sent from the controller to a device.
///
/// Serialized inside the `dps` envelope of an RPC request frame as
/// `{"id": .., "method": .., "params": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: MethodName,
    #[serde(default = "empty_params")]
    pub params: RpcParams,
}

impl Request {
    /// Creates a request. A `null` parameter set is sent as an empty list,
    /// which is what devices expect for parameterless commands.
    pub fn new(id: RequestId, method: impl Into<String>, params: RpcParams) -> Self {
        let params = if params.is_null() { empty_params() } else { params };
        Request {
            id,
            method: method.into(),
            params,
        }
    }
}

fn empty_params() -> RpcParams {
    serde_json::Value::Array(Vec::new())
}
