//! One connect-decode-publish attempt
//!
//! An attempt opens the camera input, picks the first video and audio
//! streams, and pumps packets until it is told to stop, the input ends, or
//! the stream stalls. Every packet is offered to the recorder (when
//! recording is requested), audio goes to live playback, video is decoded,
//! converted to BGRA and published to the frame buffer.
//!
//! Attempts run on a blocking thread. They talk to the rest of the system
//! only through [`AttemptContext`]: the frame buffer, the metrics counters,
//! the recording flag and the event bus.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, decoder};
use ffmpeg::format;
use ffmpeg::media;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{Packet, Rational};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::{decoder_options, decoder_threading, describe, input_options, to_dictionary};
use crate::audio::{self, LazyPlayer, PlaybackContext};
use crate::config::{parse_ffmpeg_params, CameraConfig, DiagnosticsConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::metrics::{GapEstimator, StreamMetrics};
use crate::recorder::{recording_path, AudioSourceInfo, Recorder, RecorderSlot};
use crate::utils::LogThrottler;
use crate::video::{FrameBuffer, PixelConverter};
use crate::{debug_throttled, warn_throttled};

/// An attempt with no published frame for this long is abandoned
pub const STALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Sleep after a failed packet read before trying again
const READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Everything an attempt may touch outside itself
pub struct AttemptContext<'a> {
    pub camera: &'a str,
    pub config: &'a CameraConfig,
    pub diagnostics: DiagnosticsConfig,
    pub stop: &'a CancellationToken,
    /// Requested recording state; the attempt reconciles towards it
    pub recording: &'a AtomicBool,
    pub frames: &'a FrameBuffer,
    pub metrics: &'a StreamMetrics,
    pub events: &'a EventBus,
}

/// How an attempt ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEnd {
    /// The stop signal was observed
    Stopped,
    /// The input reported end of stream
    EndOfStream,
}

/// Runs a single attempt to completion on the calling (blocking) thread
pub trait AttemptRunner: Send + Sync + 'static {
    fn run_attempt(&self, ctx: &AttemptContext<'_>) -> Result<AttemptEnd>;
}

/// Production runner backed by FFmpeg
pub struct FfmpegRunner {
    playback: Arc<PlaybackContext>,
    recordings_root: PathBuf,
}

impl FfmpegRunner {
    pub fn new(playback: Arc<PlaybackContext>, recordings_root: PathBuf) -> Self {
        Self {
            playback,
            recordings_root,
        }
    }
}

impl AttemptRunner for FfmpegRunner {
    fn run_attempt(&self, ctx: &AttemptContext<'_>) -> Result<AttemptEnd> {
        let mut attempt = DecodeAttempt::open(ctx, &self.playback, &self.recordings_root)?;
        let result = attempt.run(ctx);
        attempt.stop_recording(ctx);
        result
    }
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == libc::EAGAIN)
}

/// Selected audio stream and its decoder
struct AudioInput {
    index: usize,
    time_base: Rational,
    decoder: decoder::Audio,
}

/// Open demux/decode state for one attempt
///
/// Field order is teardown order: the recorder is closed before the
/// decoders and the input it was created from.
struct DecodeAttempt<'a> {
    recorder: RecorderSlot,
    player: LazyPlayer<'a>,
    converter: PixelConverter,
    gap: Option<GapEstimator>,
    video_decoder: decoder::Video,
    audio: Option<AudioInput>,
    video_index: usize,
    input: format::context::Input,
    recordings_root: &'a std::path::Path,
    throttle: LogThrottler,
    name: String,
    last_progress: Instant,
}

impl<'a> DecodeAttempt<'a> {
    fn open(
        ctx: &AttemptContext<'_>,
        playback: &'a PlaybackContext,
        recordings_root: &'a std::path::Path,
    ) -> Result<Self> {
        let config = ctx.config;
        let name = config.display_name().to_string();
        let params = parse_ffmpeg_params(&config.ffmpeg_params);

        let input_opts = input_options(config, &params);
        debug!("[{}] Opening input, options: {}", name, describe(&input_opts));
        let input = format::input_with_dictionary(&config.url, to_dictionary(&input_opts))?;

        let video = input
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Video)
            .ok_or(AppError::NoVideoStream)?;
        let video_index = video.index();
        let frame_rate = if video.avg_frame_rate().numerator() > 0 {
            video.avg_frame_rate()
        } else {
            video.rate()
        };
        let gap = ctx
            .diagnostics
            .collects_stream_stats()
            .then(|| GapEstimator::new(video.time_base(), frame_rate))
            .filter(GapEstimator::is_active);

        let video_params = video.parameters();
        let codec_id = video_params.id();
        let codec = decoder::find(codec_id)
            .ok_or_else(|| AppError::DecoderNotFound(format!("{:?}", codec_id)))?;

        if !config.hwaccel.is_empty() && config.hwaccel != "none" {
            debug!(
                "[{}] hwaccel '{}' requested, decoding in software",
                name, config.hwaccel
            );
        }

        let mut decoder_ctx = codec::context::Context::from_parameters(video_params)?;
        if let Some(threading) = decoder_threading(config, codec_id) {
            decoder_ctx.set_threading(threading);
        }
        let decoder_opts = decoder_options(&params);
        debug!(
            "[{}] Opening {:?} decoder, options: {}",
            name,
            codec_id,
            describe(&decoder_opts)
        );
        let video_decoder = decoder_ctx
            .decoder()
            .open_as_with(codec, to_dictionary(&decoder_opts))?
            .video()?;

        let audio = if config.mute {
            None
        } else {
            open_audio_decoder(&input).unwrap_or_else(|e| {
                warn!("[{}] Audio decoder unavailable, continuing without audio: {}", name, e);
                None
            })
        };

        info!(
            "[{}] Stream opened: {:?} {}x{}{}",
            name,
            codec_id,
            video_decoder.width(),
            video_decoder.height(),
            if audio.is_some() { " +audio" } else { "" }
        );

        Ok(Self {
            recorder: RecorderSlot::new(),
            player: LazyPlayer::new(playback),
            converter: PixelConverter::new(),
            gap,
            video_decoder,
            audio,
            video_index,
            input,
            recordings_root,
            throttle: LogThrottler::default(),
            name,
            last_progress: Instant::now(),
        })
    }

    fn run(&mut self, ctx: &AttemptContext<'_>) -> Result<AttemptEnd> {
        loop {
            if ctx.stop.is_cancelled() {
                return Ok(AttemptEnd::Stopped);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.flush_video(ctx);
                    info!("[{}] End of stream", self.name);
                    return Ok(AttemptEnd::EndOfStream);
                }
                Err(e) => {
                    self.check_stall()?;
                    warn_throttled!(self.throttle, "read", "[{}] Packet read failed: {}", self.name, e);
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }
            }
            self.reconcile_recording(ctx);
            if let Some(recorder) = self.recorder.get_mut() {
                if let Err(e) = recorder.write_packet(&packet) {
                    warn_throttled!(self.throttle, "rec_write", "[{}] Recording write failed: {}", self.name, e);
                }
            }

            let index = packet.stream();
            if self.audio.as_ref().is_some_and(|a| a.index == index) {
                self.handle_audio(&packet);
            } else if index == self.video_index {
                let started = Instant::now();
                let measured = self.handle_video(&packet, ctx);
                ctx.metrics.record_packet_busy(measured, started.elapsed());
            }
            drop(packet);

            self.check_stall()?;
        }
    }

    fn check_stall(&self) -> Result<()> {
        if self.last_progress.elapsed() > STALL_TIMEOUT {
            warn!("[{}] No frames for {}s, giving up on this connection", self.name, STALL_TIMEOUT.as_secs());
            return Err(AppError::Stall(STALL_TIMEOUT));
        }
        Ok(())
    }

    /// Start or stop the recorder to match the requested state
    fn reconcile_recording(&mut self, ctx: &AttemptContext<'_>) {
        let wanted = ctx.recording.load(Ordering::Acquire);
        let now = Instant::now();

        if wanted && !self.recorder.is_active() && self.recorder.may_retry(now) {
            let path = recording_path(
                self.recordings_root,
                &ctx.config.name,
                &ctx.config.url,
                &chrono::Local::now(),
            );
            let audio = self
                .audio
                .as_ref()
                .map(|a| AudioSourceInfo::from_decoder(&a.decoder, a.time_base));
            let input = &self.input;
            match self
                .recorder
                .start_with(now, || Recorder::start(input, audio, &path))
            {
                Ok(true) => ctx.events.publish(SessionEvent::RecordingStarted {
                    camera: ctx.camera.to_string(),
                    path,
                }),
                Ok(false) => {}
                Err(e) => warn!("[{}] Recording failed to start: {}", self.name, e),
            }
        } else if !wanted && self.recorder.is_active() {
            self.stop_recording(ctx);
        }
    }

    fn stop_recording(&mut self, ctx: &AttemptContext<'_>) {
        let path = self.recorder.get_mut().map(|r| r.path().to_path_buf());
        match self.recorder.stop() {
            Ok(true) => {
                if let Some(path) = path {
                    ctx.events.publish(SessionEvent::RecordingStopped {
                        camera: ctx.camera.to_string(),
                        path,
                    });
                }
            }
            Ok(false) => {}
            Err(e) => warn!("[{}] Recording did not finalize cleanly: {}", self.name, e),
        }
    }

    fn handle_audio(&mut self, packet: &Packet) {
        let Some(decoder) = self.audio.as_mut().map(|a| &mut a.decoder) else {
            return;
        };
        if let Err(e) = decoder.send_packet(packet) {
            if !is_again(&e) {
                debug_throttled!(self.throttle, "audio_decode", "[{}] Audio decode error: {}", self.name, e);
                return;
            }
        }

        let mut frame = AudioFrame::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            if let Some(pcm) = audio::playable_pcm(&frame) {
                self.player.play(pcm);
            }
            if let Some(recorder) = self.recorder.get_mut() {
                if let Err(e) = recorder.write_audio(&frame) {
                    warn_throttled!(self.throttle, "rec_audio", "[{}] Recording audio failed: {}", self.name, e);
                }
            }
        }
    }

    /// Decode one video packet and publish every frame it yields.
    /// Returns the time spent converting and storing frames.
    fn handle_video(&mut self, packet: &Packet, ctx: &AttemptContext<'_>) -> Duration {
        if ctx.diagnostics.collects_stream_stats() {
            ctx.metrics.record_bytes(packet.size());
            if let Some(gap) = self.gap.as_mut() {
                let missing = gap.observe(packet.pts(), packet.dts());
                if missing > 0 {
                    ctx.metrics.record_missing(missing);
                }
            }
        }

        if let Err(e) = self.video_decoder.send_packet(packet) {
            if !is_again(&e) {
                ctx.metrics.record_decode_error();
                debug_throttled!(self.throttle, "video_send", "[{}] Video decode error: {}", self.name, e);
            }
        }
        self.drain_video(ctx)
    }

    fn flush_video(&mut self, ctx: &AttemptContext<'_>) {
        if self.video_decoder.send_eof().is_ok() {
            let busy = self.drain_video(ctx);
            ctx.metrics.record_busy(busy);
        }
    }

    fn drain_video(&mut self, ctx: &AttemptContext<'_>) -> Duration {
        let mut busy = Duration::ZERO;
        let mut frame = Video::empty();
        loop {
            match self.video_decoder.receive_frame(&mut frame) {
                Ok(()) => busy += self.publish(&frame, ctx),
                Err(ffmpeg::Error::Eof) => break,
                Err(e) if is_again(&e) => break,
                Err(e) => {
                    ctx.metrics.record_decode_error();
                    debug_throttled!(self.throttle, "video_recv", "[{}] Video decode error: {}", self.name, e);
                    break;
                }
            }
        }
        busy
    }

    fn publish(&mut self, frame: &Video, ctx: &AttemptContext<'_>) -> Duration {
        let started = Instant::now();
        match self.converter.convert(frame) {
            Ok(converted) => {
                match ctx
                    .frames
                    .put(converted.width, converted.height, converted.data)
                {
                    Ok(_) => {
                        let now = Instant::now();
                        self.last_progress = now;
                        ctx.metrics.record_frame(now);
                    }
                    Err(e) => {
                        warn_throttled!(self.throttle, "publish", "[{}] Frame publish failed: {}", self.name, e)
                    }
                }
            }
            Err(e) => {
                warn_throttled!(self.throttle, "convert", "[{}] Frame conversion failed: {}", self.name, e)
            }
        }
        started.elapsed()
    }
}

impl Drop for DecodeAttempt<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.recorder.stop() {
            warn!("[{}] Recording did not finalize cleanly: {}", self.name, e);
        }
        debug!("[{}] Attempt closed", self.name);
    }
}

/// First audio stream with a working decoder
fn open_audio_decoder(input: &format::context::Input) -> Result<Option<AudioInput>> {
    let Some(stream) = input
        .streams()
        .find(|s| s.parameters().medium() == media::Type::Audio)
    else {
        return Ok(None);
    };
    let decoder = codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .audio()?;
    Ok(Some(AudioInput {
        index: stream.index(),
        time_base: stream.time_base(),
        decoder,
    }))
}
