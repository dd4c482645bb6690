//! Cursor-stamped notification buffering and the remote stream relay.

pub mod ring;
pub mod sse;
pub mod stream;

pub use ring::{BufferedNotification, NotificationRing, Replay};
pub use sse::SseChunkParser;
pub use stream::{is_forwardable, NotificationRelay, FORWARDABLE_METHODS};
