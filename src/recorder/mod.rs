//! Recording sub-pipeline
//!
//! Muxes the live input into an mp4 next to playback: video packets are
//! stream-copied, audio is re-encoded to AAC. A [`Recorder`] only exists
//! while recording is active; dropping it finalizes the file.
//!
//! Live inputs carry wall-clock timestamps, so every track is rebased to
//! the first copied keyframe. Audio before that point is dropped.

pub mod audio;
pub mod path;
#[cfg(test)]
pub(crate) mod test_source;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, encoder};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::{format, media, rescale, Packet, Rational, Rescale};
use tracing::{info, warn};

pub use audio::{AudioSourceInfo, AudioTranscoder};
pub use path::{recording_path, sanitize_name};

use crate::error::{AppError, Result};

/// Minimum delay between failed recorder start attempts
pub const START_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct VideoTrack {
    output_index: usize,
    input_time_base: Rational,
}

/// One open recording
pub struct Recorder {
    octx: format::context::Output,
    path: PathBuf,
    video: HashMap<usize, VideoTrack>,
    audio: Option<AudioTranscoder>,
    /// Input time of the first copied keyframe, in microseconds.
    /// `None` while waiting for it.
    origin_us: Option<i64>,
    packets: u64,
    finished: bool,
}

impl Recorder {
    /// Create the output file, add one stream-copy track per input video
    /// stream and an AAC track when `audio` is given, then write the header.
    ///
    /// On failure nothing stays open and the partial file is removed.
    pub fn start(
        input: &format::context::Input,
        audio: Option<AudioSourceInfo>,
        path: &Path,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::open(input, audio, path) {
            Ok(recorder) => {
                info!("Recording started -> {}", path.display());
                Ok(recorder)
            }
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    fn open(
        input: &format::context::Input,
        audio: Option<AudioSourceInfo>,
        path: &Path,
    ) -> Result<Self> {
        let mut octx = format::output_as(&path, "mp4")
            .map_err(|e| AppError::Recorder(format!("cannot create {}: {}", path.display(), e)))?;

        let mut video = HashMap::new();
        for ist in input.streams() {
            if ist.parameters().medium() != media::Type::Video {
                continue;
            }
            let mut ost = octx.add_stream(encoder::find(codec::Id::None))?;
            ost.set_parameters(ist.parameters());
            ost.set_time_base(ist.time_base());
            // Let the mp4 muxer pick its own tag for the copied codec
            unsafe {
                (*ost.parameters().as_mut_ptr()).codec_tag = 0;
            }
            video.insert(
                ist.index(),
                VideoTrack {
                    output_index: ost.index(),
                    input_time_base: ist.time_base(),
                },
            );
        }
        if video.is_empty() {
            return Err(AppError::Recorder("no video stream to record".to_string()));
        }

        let audio = match audio {
            Some(source) => Some(AudioTranscoder::add_to(&mut octx, source)?),
            None => None,
        };

        octx.write_header()
            .map_err(|e| AppError::Recorder(format!("header write failed: {}", e)))?;

        Ok(Self {
            octx,
            path: path.to_path_buf(),
            video,
            audio,
            origin_us: None,
            packets: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the recorder has an AAC track
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Whether packets from this input stream are copied
    pub fn tracks(&self, input_index: usize) -> bool {
        self.video.contains_key(&input_index)
    }

    /// Recording origin on the input clock, once the first keyframe is in
    pub fn origin_us(&self) -> Option<i64> {
        self.origin_us
    }

    /// Packets written so far (video copies only)
    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    /// Stream-copy one input packet, if its stream is tracked
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let Some(track) = self.video.get(&packet.stream()).copied() else {
            return Ok(());
        };
        let origin_us = match self.origin_us {
            Some(origin) => origin,
            None if packet.is_key() => {
                let origin = packet
                    .dts()
                    .or(packet.pts())
                    .map_or(0, |ts| ts.rescale(track.input_time_base, rescale::TIME_BASE));
                self.origin_us = Some(origin);
                origin
            }
            None => return Ok(()),
        };
        let shift = origin_us.rescale(rescale::TIME_BASE, track.input_time_base);

        let out_time_base = self
            .octx
            .stream(track.output_index)
            .map(|s| s.time_base())
            .ok_or_else(|| AppError::Recorder("video output stream missing".to_string()))?;

        let mut copy = packet.clone();
        copy.set_pts(packet.pts().map(|ts| ts - shift));
        copy.set_dts(packet.dts().map(|ts| ts - shift));
        copy.rescale_ts(track.input_time_base, out_time_base);
        copy.set_position(-1);
        copy.set_stream(track.output_index);
        copy.write_interleaved(&mut self.octx)?;
        self.packets += 1;
        Ok(())
    }

    /// Encode one decoded audio frame into the AAC track
    pub fn write_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        match (self.audio.as_mut(), self.origin_us) {
            (Some(audio), Some(origin_us)) => audio.push(frame, origin_us, &mut self.octx),
            _ => Ok(()),
        }
    }

    /// Flush the encoder, write the trailer and close the file. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let flushed = match self.audio.as_mut() {
            Some(audio) => audio.finish(&mut self.octx),
            None => Ok(()),
        };
        if let Err(e) = &flushed {
            warn!("Recording {}: audio flush failed: {}", self.path.display(), e);
        }

        self.octx
            .write_trailer()
            .map_err(|e| AppError::Recorder(format!("trailer write failed: {}", e)))?;
        info!(
            "Recording stopped -> {} ({} video packets)",
            self.path.display(),
            self.packets
        );
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Recording {}: {}", self.path.display(), e);
        }
    }
}

/// At-most-one recorder holder with idempotent start/stop
#[derive(Default)]
pub struct RecorderSlot {
    active: Option<Recorder>,
    last_failure: Option<Instant>,
}

impl RecorderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn get_mut(&mut self) -> Option<&mut Recorder> {
        self.active.as_mut()
    }

    /// Whether a failed start should be retried at `now`
    pub fn may_retry(&self, now: Instant) -> bool {
        self.last_failure
            .map_or(true, |at| now.duration_since(at) >= START_RETRY_INTERVAL)
    }

    /// Start a recorder with `open` unless one is already active.
    ///
    /// Returns `Ok(false)` when already started.
    pub fn start_with<F>(&mut self, now: Instant, open: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Recorder>,
    {
        if self.active.is_some() {
            return Ok(false);
        }
        match open() {
            Ok(recorder) => {
                self.active = Some(recorder);
                self.last_failure = None;
                Ok(true)
            }
            Err(e) => {
                self.last_failure = Some(now);
                Err(e)
            }
        }
    }

    /// Finalize and drop the active recorder. Returns `Ok(false)` when idle.
    pub fn stop(&mut self) -> Result<bool> {
        match self.active.take() {
            Some(mut recorder) => {
                recorder.finish()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_source::write_test_source;
    use super::*;
    use tempfile::TempDir;

    const SECOND_US: i64 = 1_000_000;

    #[test]
    fn test_record_lifecycle_produces_playable_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.mkv");
        write_test_source(&src, false);

        let mut input = format::input(&src).unwrap();
        let out = dir.path().join("Yard").join("clip.mp4");
        let now = Instant::now();

        let mut slot = RecorderSlot::new();
        assert!(slot
            .start_with(now, || Recorder::start(&input, None, &out))
            .unwrap());
        assert!(!slot
            .start_with(now, || panic!("second start must be a no-op"))
            .unwrap());
        assert!(!slot.get_mut().unwrap().has_audio());

        let mut packet = Packet::empty();
        while packet.read(&mut input).is_ok() {
            let recorder = slot.get_mut().unwrap();
            assert!(recorder.tracks(packet.stream()));
            recorder.write_packet(&packet).unwrap();
        }
        assert!(slot.get_mut().unwrap().packets_written() > 0);

        assert!(slot.stop().unwrap());
        assert!(!slot.stop().unwrap());

        let check = format::input(&out).unwrap();
        assert_eq!(check.streams().count(), 1);
        assert!(check.duration() > 0);
        assert!(check.duration() < 5 * SECOND_US);
    }

    #[test]
    fn test_audio_recording_is_aac_and_starts_at_origin() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.mkv");
        write_test_source(&src, true);

        let mut input = format::input(&src).unwrap();
        let audio_stream = input
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Audio)
            .unwrap();
        let audio_index = audio_stream.index();
        let audio_tb = audio_stream.time_base();
        let mut audio_dec = codec::context::Context::from_parameters(audio_stream.parameters())
            .unwrap()
            .decoder()
            .audio()
            .unwrap();
        let source = AudioSourceInfo::from_decoder(&audio_dec, audio_tb);

        let out = dir.path().join("clip.mp4");
        let mut recorder = Recorder::start(&input, Some(source), &out).unwrap();
        assert!(recorder.has_audio());
        assert!(recorder.origin_us().is_none());

        let mut packet = Packet::empty();
        let mut frame = AudioFrame::empty();
        while packet.read(&mut input).is_ok() {
            recorder.write_packet(&packet).unwrap();
            if packet.stream() == audio_index {
                audio_dec.send_packet(&packet).unwrap();
                while audio_dec.receive_frame(&mut frame).is_ok() {
                    recorder.write_audio(&frame).unwrap();
                }
            }
        }
        assert!(recorder.origin_us().is_some());
        recorder.finish().unwrap();
        drop(recorder);

        let check = format::input(&out).unwrap();
        assert_eq!(check.streams().count(), 2);
        let aac = check
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Audio)
            .unwrap();
        assert_eq!(aac.parameters().id(), codec::Id::AAC);

        assert!(check.duration() > 0);
        assert!(check.duration() < 5 * SECOND_US);
        for stream in check.streams() {
            let start = stream
                .start_time()
                .rescale(stream.time_base(), rescale::TIME_BASE);
            assert!(start.abs() < SECOND_US, "stream {} starts at {}us", stream.index(), start);
        }
    }

    #[test]
    fn test_start_failure_leaves_nothing_open() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.mkv");
        write_test_source(&src, false);
        let input = format::input(&src).unwrap();

        // parent "directory" is a regular file
        let out = src.join("nested").join("clip.mp4");
        let mut slot = RecorderSlot::new();
        assert!(slot
            .start_with(Instant::now(), || Recorder::start(&input, None, &out))
            .is_err());
        assert!(!slot.is_active());
        assert!(!out.exists());
    }

    #[test]
    fn test_idle_slot() {
        let mut slot = RecorderSlot::new();
        assert!(!slot.is_active());
        assert!(!slot.stop().unwrap());
        assert!(!slot.stop().unwrap());
        assert!(slot.get_mut().is_none());
        assert!(slot.may_retry(Instant::now()));
    }

    #[test]
    fn test_failed_start_backs_off() {
        let mut slot = RecorderSlot::new();
        let now = Instant::now();
        let res = slot.start_with(now, || Err(AppError::Recorder("boom".to_string())));
        assert!(res.is_err());
        assert!(!slot.is_active());
        assert!(!slot.may_retry(now + Duration::from_secs(1)));
        assert!(slot.may_retry(now + START_RETRY_INTERVAL));
    }
}
