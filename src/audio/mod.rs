//! Live audio playback
//!
//! Playback only accepts one PCM layout: signed 16-bit, packed, mono, 8 kHz
//! (the G.711 family most cameras send). Frames in any other layout are still
//! decoded, and may be recorded, but are not played.

pub mod playback;

use ffmpeg_next::format::{sample::Type as SampleType, Sample};
use ffmpeg_next::util::frame::audio::Audio as AudioFrame;

pub use playback::{LazyPlayer, PcmPlayer, PlaybackContext};

/// Sample rate accepted for live playback
pub const PLAYBACK_RATE: u32 = 8000;
/// Channel count accepted for live playback
pub const PLAYBACK_CHANNELS: u32 = 1;

/// Whether a decoded frame with these properties can go to the playback sink
pub fn is_playable(format: Sample, channels: u16, rate: u32) -> bool {
    format == Sample::I16(SampleType::Packed)
        && channels as u32 == PLAYBACK_CHANNELS
        && rate == PLAYBACK_RATE
}

/// Number of PCM bytes a playable frame carries, bounded by its sample count
pub fn playable_len(samples: usize, available: usize) -> usize {
    (samples * 2 * PLAYBACK_CHANNELS as usize).min(available)
}

/// Raw PCM bytes of a decoded frame, if it is in the playable layout
pub fn playable_pcm(frame: &AudioFrame) -> Option<&[u8]> {
    if !is_playable(frame.format(), frame.channels(), frame.rate()) {
        return None;
    }
    let data = frame.data(0);
    Some(&data[..playable_len(frame.samples(), data.len())])
}
