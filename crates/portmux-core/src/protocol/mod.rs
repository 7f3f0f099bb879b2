//! Protocol module containing frame types and the binary codec.

pub mod codec;
pub mod frames;

pub use codec::{encode_frame, FrameDecoder, ProtocolError};
pub use frames::*;
