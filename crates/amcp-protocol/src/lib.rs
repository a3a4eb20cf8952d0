pub mod adapter;
pub mod error;

pub use adapter::{from_acp_update, to_http_chunk, to_sse_frame, to_ws_frame, WsFrame};
pub use error::{ErrorBody, ErrorCode};
