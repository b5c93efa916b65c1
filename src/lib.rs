//! CamWall - self-healing RTSP camera decode core
//!
//! Each configured camera gets a session that keeps an FFmpeg decode
//! attempt alive, publishes the newest BGRA frame, plays G.711 audio,
//! records to mp4 on request and reports health metrics.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod recorder;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
