pub mod client;
pub mod event;
pub mod frame;

pub use client::{ClientError, RelayClient};
pub use event::{is_valid_event_name, ControlEvent, Event};
pub use frame::{
    decode_frame, encode_frame, Frame, FrameError, FrameStream, DEFAULT_MAX_FRAME_BYTES,
};
