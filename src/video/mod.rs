//! Decoded video hand-off
//!
//! Decoded frames are converted to packed BGRA and stored in a single-slot
//! buffer the presentation layer polls.

pub mod convert;
pub mod frame;

pub use convert::{Converted, PixelConverter, SourceKey, DISPLAY_FORMAT};
pub use frame::{FrameBuffer, FrameRef, VideoFrame, BYTES_PER_PIXEL};
