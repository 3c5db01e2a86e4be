//! Wire protocol shared by clients, storage nodes and the ECS
//!
//! Two layers:
//! - `frame`: correlation id + length-prefixed body (transport)
//! - `message`: the bincode-encoded `KvMessage` inside a body (application)

pub mod frame;
pub mod message;

pub use frame::{FrameStatus, RequestFrame, ResponseFrame, MAX_FRAME_BODY};
pub use message::{AdminCommand, KvMessage, StatusType, NO_METADATA, REQUEST_TIMED_OUT};
