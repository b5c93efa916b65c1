//! Configuration records, persistence and extra-parameter parsing

pub mod params;
mod schema;
mod store;

pub use params::{parse_ffmpeg_params, FfmpegParams};
pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
