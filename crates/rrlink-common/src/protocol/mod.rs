pub mod error;
pub mod message;
pub mod requests;
pub mod responses;


pub use error::{ApiErrorKind, ErrorKind, RrError, Result};
pub use message::{Message, MessageBody, Protocol};
pub use requests::{MethodName, Request, RequestId, RpcParams};
pub use responses::{Response, RpcResult};
