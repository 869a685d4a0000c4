//! Wire formats: client framing and worker IPC frames.

pub mod frame;
pub mod ipc;

pub use frame::{encode_frame, read_frame, write_frame, FrameDecoder};
pub use ipc::{
    encode_reply, encode_request, CtrlReply, CtrlRequest, ReadyFrame, ReplyDecoder, ReplyFrame,
    RequestDecoder, RequestFrame, StackEntry,
};
