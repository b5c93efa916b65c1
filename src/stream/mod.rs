//! Camera stream supervision
//!
//! - [`options`]: input/decoder option dictionaries
//! - [`supervisor`]: one connect-decode-publish attempt
//! - [`backoff`]: reconnect timing
//! - [`session`]: per-camera restart controller
//! - [`registry`]: all open sessions

pub mod backoff;
pub mod options;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use backoff::{Backoff, RestartPolicy};
pub use registry::SessionRegistry;
pub use session::{CameraSession, SessionDeps, SessionState, SessionStatus};
pub use supervisor::{AttemptContext, AttemptEnd, AttemptRunner, FfmpegRunner, STALL_TIMEOUT};

use ffmpeg_next as ffmpeg;

use crate::error::Result;

/// Initialize FFmpeg once per process. `verbose` turns on its own debug log.
pub fn init_ffmpeg(verbose: bool) -> Result<()> {
    ffmpeg::init()?;
    ffmpeg::format::network::init();
    ffmpeg::util::log::set_level(if verbose {
        ffmpeg::util::log::Level::Debug
    } else {
        ffmpeg::util::log::Level::Error
    });
    Ok(())
}
