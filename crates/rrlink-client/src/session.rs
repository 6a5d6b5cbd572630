use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rrlink_common::protocol::{Message, Request, RequestId, Result, RpcParams};

use crate::transport::Transport;

/// Per-device state: identity, id counter and the chosen channel.
///
/// The device's local key lives in the transport's codec, so every frame
/// encoded here is protected with it.
pub struct DeviceSession {
    duid: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU32,
}

impl DeviceSession {
    pub fn new(duid: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            duid: duid.into(),
            transport,
            next_id: AtomicU32::new(1),
        }
    }

    pub fn duid(&self) -> &str {
        &self.duid
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Allocates the next request id.
    ///
    /// Ids increase monotonically, wrap around skipping `0`, and skip any id
    /// for which `in_use` returns true.
    pub fn allocate_id(&self, in_use: impl Fn(RequestId) -> bool) -> RequestId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !in_use(id) {
                return id;
            }
        }
    }

    /// Encodes a request frame. The frame `seq` equals the request id.
    pub fn encode_request(
        &self,
        id: RequestId,
        method: &str,
        params: RpcParams,
    ) -> Result<Vec<u8>> {
        let message = Message::request(id, Request::new(id, method, params));
        self.transport.codec().encode(&message)
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("duid", &self.duid)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}
