// Transport layer for the message plane
//
// Length-prefixed TCP framing in both directions: a multi-reader framed
// receiver on the inbound side, a per-peer sender pool on the outbound
// side, with pooled receive buffers between them.

pub mod buffer;
pub mod frame;
pub mod receiver;
pub mod sender;

pub use buffer::{BufferPool, LazyFrame};
pub use frame::{encode_frame, FrameDecoder};
pub use receiver::FramedReceiver;
pub use sender::{Sender, SenderPool};

/// Callback for complete inbound frames.
///
/// The frame is a one-shot lazy reader; reading it or dropping it returns
/// the underlying buffer to the receive pool.
pub trait Listener: Send + Sync {
    fn on_message(&self, frame: LazyFrame);
}
