//! ALSA playback sink
//!
//! Each camera gets its own PCM handle, opened the first time its decode
//! attempt produces a playable frame. Writes never block the decode thread:
//! the handle is non-blocking and a full buffer simply drops the chunk.

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use tracing::{debug, info, warn};

use super::{PLAYBACK_CHANNELS, PLAYBACK_RATE};
use crate::config::AudioConfig;
use crate::error::{AppError, Result};

/// Buffer of half a second at the playback rate
const BUFFER_FRAMES: u32 = PLAYBACK_RATE / 2;
/// 50 ms periods
const PERIOD_FRAMES: u32 = PLAYBACK_RATE / 20;
const BYTES_PER_FRAME: usize = 2 * PLAYBACK_CHANNELS as usize;

/// Shared playback settings; hands out per-camera players
#[derive(Debug, Clone)]
pub struct PlaybackContext {
    config: AudioConfig,
}

impl PlaybackContext {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    /// A context that never opens a device
    pub fn disabled() -> Self {
        Self {
            config: AudioConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn device(&self) -> &str {
        &self.config.device
    }

    /// Open a new player on the configured device
    pub fn open_player(&self) -> Result<PcmPlayer> {
        if !self.config.enabled {
            return Err(AppError::AudioError("playback disabled".to_string()));
        }
        PcmPlayer::open(&self.config.device)
    }
}

/// Non-blocking S16LE mono 8 kHz playback handle
pub struct PcmPlayer {
    pcm: PCM,
    device: String,
}

impl PcmPlayer {
    pub fn open(device: &str) -> Result<Self> {
        let pcm = PCM::new(device, Direction::Playback, true).map_err(|e| {
            AppError::AudioError(format!("Failed to open playback device {}: {}", device, e))
        })?;

        {
            let hwp = HwParams::any(&pcm)
                .map_err(|e| AppError::AudioError(format!("Failed to get HwParams: {}", e)))?;

            hwp.set_channels(PLAYBACK_CHANNELS)
                .map_err(|e| AppError::AudioError(format!("Failed to set channels: {}", e)))?;

            hwp.set_rate(PLAYBACK_RATE, ValueOr::Nearest)
                .map_err(|e| AppError::AudioError(format!("Failed to set sample rate: {}", e)))?;

            hwp.set_format(Format::s16())
                .map_err(|e| AppError::AudioError(format!("Failed to set format: {}", e)))?;

            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| AppError::AudioError(format!("Failed to set access: {}", e)))?;

            hwp.set_buffer_size_near(BUFFER_FRAMES as Frames)
                .map_err(|e| AppError::AudioError(format!("Failed to set buffer size: {}", e)))?;

            hwp.set_period_size_near(PERIOD_FRAMES as Frames, ValueOr::Nearest)
                .map_err(|e| AppError::AudioError(format!("Failed to set period size: {}", e)))?;

            pcm.hw_params(&hwp)
                .map_err(|e| AppError::AudioError(format!("Failed to apply hw params: {}", e)))?;
        }

        pcm.prepare()
            .map_err(|e| AppError::AudioError(format!("Failed to prepare PCM: {}", e)))?;

        info!(
            "Audio playback opened on {}: {}Hz {}ch",
            device, PLAYBACK_RATE, PLAYBACK_CHANNELS
        );

        Ok(Self {
            pcm,
            device: device.to_string(),
        })
    }

    /// Queue interleaved S16LE bytes; returns frames accepted.
    ///
    /// A full device buffer drops the chunk rather than waiting.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let usable = data.len() - data.len() % BYTES_PER_FRAME;
        if usable == 0 {
            return Ok(0);
        }

        match self.pcm.state() {
            State::XRun => {
                debug!("Playback underrun on {}, recovering", self.device);
                let _ = self.pcm.prepare();
            }
            State::Suspended => {
                warn!("Playback device {} suspended, recovering", self.device);
                let _ = self.pcm.resume();
            }
            _ => {}
        }

        let io: IO<u8> = self.pcm.io_bytes();
        match io.writei(&data[..usable]) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                let desc = e.to_string();
                if desc.contains("EAGAIN") || desc.contains("temporarily unavailable") {
                    Ok(0)
                } else if desc.contains("EPIPE") || desc.contains("Broken pipe") {
                    debug!("Playback underrun on {} during write, recovering", self.device);
                    let _ = self.pcm.prepare();
                    Ok(0)
                } else {
                    Err(AppError::AudioError(format!(
                        "Playback write on {} failed: {}",
                        self.device, e
                    )))
                }
            }
        }
    }
}

impl Drop for PcmPlayer {
    fn drop(&mut self) {
        debug!("Audio playback closed on {}", self.device);
    }
}

/// Per-attempt player slot: opened on first use, never retried after a
/// failed open within the same attempt.
pub struct LazyPlayer<'a> {
    context: &'a PlaybackContext,
    player: Option<PcmPlayer>,
    open_failed: bool,
}

impl<'a> LazyPlayer<'a> {
    pub fn new(context: &'a PlaybackContext) -> Self {
        Self {
            context,
            player: None,
            open_failed: !context.is_enabled(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.player.is_some()
    }

    /// Play raw PCM, opening the device if needed. Errors are logged, not returned.
    pub fn play(&mut self, data: &[u8]) {
        if self.open_failed {
            return;
        }
        if self.player.is_none() {
            match self.context.open_player() {
                Ok(player) => self.player = Some(player),
                Err(e) => {
                    warn!("Audio playback unavailable: {}", e);
                    self.open_failed = true;
                    return;
                }
            }
        }
        if let Some(player) = self.player.as_mut() {
            if let Err(e) = player.write(data) {
                warn!("{}", e);
                self.player = None;
                self.open_failed = true;
            }
        }
    }
}
