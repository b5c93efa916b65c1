//! AAC re-encode stage of the recorder
//!
//! Decoded camera audio (usually G.711 at 8 kHz) is resampled to the AAC
//! encoder's sample format, regrouped into encoder-sized frames and written
//! to the recorder's audio stream.
//!
//! Output timestamps count samples from the recording origin. The first
//! frame at or after the origin anchors the count; later frames only add
//! their sample count, so jitter in the camera's timestamps never reaches
//! the file.

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, decoder, encoder};
use ffmpeg::format::{self, Sample};
use ffmpeg::software::resampling::context::Context as Resampler;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::{rescale, ChannelLayout, Packet, Rational, Rescale};
use tracing::debug;

use crate::error::{AppError, Result};

/// Target AAC bitrate
pub const AAC_BIT_RATE: usize = 64_000;
/// Sample rate assumed when the decoder does not report one
pub const FALLBACK_SAMPLE_RATE: u32 = 8000;

/// Audio properties the encoder is built from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSourceInfo {
    pub rate: u32,
    pub layout: ChannelLayout,
    /// Time base of the input stream the decoded frames come from
    pub time_base: Rational,
}

impl AudioSourceInfo {
    pub fn from_decoder(decoder: &decoder::Audio, time_base: Rational) -> Self {
        Self {
            rate: if decoder.rate() > 0 {
                decoder.rate()
            } else {
                FALLBACK_SAMPLE_RATE
            },
            layout: effective_layout(decoder.channel_layout(), decoder.channels()),
            time_base,
        }
    }
}

/// Use the reported layout, or the default one for the channel count
pub fn effective_layout(layout: ChannelLayout, channels: u16) -> ChannelLayout {
    if !layout.is_empty() {
        layout
    } else if channels > 1 {
        ChannelLayout::default(channels as i32)
    } else {
        ChannelLayout::MONO
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ResampleKey {
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
}

/// Accumulates converted samples until a full encoder frame is available
#[derive(Debug)]
pub struct SampleFifo {
    planes: Vec<Vec<u8>>,
    /// Bytes per sample in one plane
    unit: usize,
    samples: usize,
}

impl SampleFifo {
    pub fn new(format: Sample, channels: usize) -> Self {
        let channels = channels.max(1);
        let (planes, unit) = if format.is_planar() {
            (channels, format.bytes())
        } else {
            (1, format.bytes() * channels)
        };
        Self {
            planes: vec![Vec::new(); planes],
            unit,
            samples: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Append `samples` samples from per-plane byte slices
    pub fn push_planes(&mut self, planes: &[&[u8]], samples: usize) -> Result<()> {
        let bytes = samples * self.unit;
        if planes.len() != self.planes.len() || planes.iter().any(|p| p.len() < bytes) {
            return Err(AppError::Recorder(format!(
                "audio frame layout mismatch: {} planes for {} expected",
                planes.len(),
                self.planes.len()
            )));
        }
        for (dst, src) in self.planes.iter_mut().zip(planes) {
            dst.extend_from_slice(&src[..bytes]);
        }
        self.samples += samples;
        Ok(())
    }

    /// Remove exactly `samples` samples, copying each plane into `out`
    pub fn pop_into<F>(&mut self, samples: usize, mut out: F) -> bool
    where
        F: FnMut(usize, &[u8]),
    {
        if samples == 0 || self.samples < samples {
            return false;
        }
        let bytes = samples * self.unit;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            out(index, &plane[..bytes]);
            plane.drain(..bytes);
        }
        self.samples -= samples;
        true
    }
}

/// Resample + AAC encode pipeline bound to one output stream
pub struct AudioTranscoder {
    encoder: encoder::audio::Encoder,
    resampler: Option<(ResampleKey, Resampler)>,
    fifo: SampleFifo,
    stream_index: usize,
    source_time_base: Rational,
    time_base: Rational,
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    frame_size: usize,
    /// Next output pts; `None` until the first frame past the origin
    next_pts: Option<i64>,
}

impl AudioTranscoder {
    /// Add an AAC stream to `octx` and open its encoder
    pub fn add_to(octx: &mut format::context::Output, source: AudioSourceInfo) -> Result<Self> {
        let codec = encoder::find(codec::Id::AAC)
            .ok_or_else(|| AppError::Recorder("AAC encoder not found".to_string()))?;
        let format = codec
            .audio()?
            .formats()
            .and_then(|mut formats| formats.next())
            .ok_or_else(|| AppError::Recorder("AAC encoder lists no sample format".to_string()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let time_base = Rational::new(1, source.rate as i32);
        let mut enc = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()?;
        enc.set_rate(source.rate as i32);
        enc.set_channel_layout(source.layout);
        enc.set_format(format);
        enc.set_bit_rate(AAC_BIT_RATE);
        enc.set_time_base(time_base);
        if global_header {
            enc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = enc
            .open_as(codec)
            .map_err(|e| AppError::Recorder(format!("AAC encoder open failed: {}", e)))?;

        let stream_index = {
            let mut ost = octx.add_stream(codec)?;
            ost.set_parameters(&encoder);
            ost.set_time_base(time_base);
            ost.index()
        };

        let frame_size = encoder.frame_size() as usize;
        debug!(
            "AAC stream #{}: {} Hz {:?} {:?}, frame size {}",
            stream_index, source.rate, source.layout, format, frame_size
        );

        Ok(Self {
            encoder,
            resampler: None,
            fifo: SampleFifo::new(format, source.layout.channels().max(1) as usize),
            stream_index,
            source_time_base: source.time_base,
            time_base,
            format,
            layout: source.layout,
            rate: source.rate,
            frame_size,
            next_pts: None,
        })
    }

    /// Position of `frame` relative to `origin_us`, in output samples.
    /// Frames without a timestamp count as starting at the origin.
    fn offset_from(&self, frame: &AudioFrame, origin_us: i64) -> i64 {
        match frame.pts().or_else(|| frame.timestamp()) {
            Some(pts) => {
                pts.rescale(self.source_time_base, self.time_base)
                    - origin_us.rescale(rescale::TIME_BASE, self.time_base)
            }
            None => 0,
        }
    }

    /// Convert, encode and write one decoded frame.
    ///
    /// `origin_us` is the recording origin in microseconds on the input
    /// clock. Frames that end before it are dropped.
    pub fn push(
        &mut self,
        frame: &AudioFrame,
        origin_us: i64,
        octx: &mut format::context::Output,
    ) -> Result<()> {
        if self.next_pts.is_none() {
            let offset = self.offset_from(frame, origin_us);
            if offset + (frame.samples() as i64) <= 0 {
                return Ok(());
            }
            self.next_pts = Some(offset.max(0));
        }

        let key = ResampleKey {
            format: frame.format(),
            layout: effective_layout(frame.channel_layout(), frame.channels()),
            rate: if frame.rate() > 0 { frame.rate() } else { self.rate },
        };
        if self.resampler.as_ref().map(|(k, _)| *k) != Some(key) {
            let resampler =
                Resampler::get(key.format, key.layout, key.rate, self.format, self.layout, self.rate)
                    .map_err(|e| AppError::Recorder(format!("resampler setup failed: {}", e)))?;
            self.resampler = Some((key, resampler));
        }

        let mut converted = AudioFrame::empty();
        if let Some((_, resampler)) = self.resampler.as_mut() {
            resampler
                .run(frame, &mut converted)
                .map_err(|e| AppError::Recorder(format!("resample failed: {}", e)))?;
        }

        let samples = converted.samples();
        if samples > 0 {
            let planes: Vec<&[u8]> = (0..converted.planes()).map(|p| converted.data(p)).collect();
            self.fifo.push_planes(&planes, samples)?;
        }

        let chunk = if self.frame_size > 0 {
            self.frame_size
        } else {
            self.fifo.len()
        };
        while self.fifo.len() >= chunk && chunk > 0 {
            self.encode_chunk(chunk, octx)?;
        }
        Ok(())
    }

    /// Encode what is left in the FIFO, flush the encoder and write the tail
    pub fn finish(&mut self, octx: &mut format::context::Output) -> Result<()> {
        let rest = self.fifo.len();
        if rest > 0 {
            self.encode_chunk(rest, octx)?;
        }
        self.encoder.send_eof()?;
        self.drain(octx)
    }

    fn encode_chunk(&mut self, samples: usize, octx: &mut format::context::Output) -> Result<()> {
        let mut out = AudioFrame::new(self.format, samples, self.layout);
        out.set_rate(self.rate);
        self.fifo.pop_into(samples, |plane, bytes| {
            out.data_mut(plane)[..bytes.len()].copy_from_slice(bytes);
        });
        let pts = self.next_pts.unwrap_or(0);
        out.set_pts(Some(pts));
        self.next_pts = Some(pts + samples as i64);

        self.encoder.send_frame(&out)?;
        self.drain(octx)
    }

    fn drain(&mut self, octx: &mut format::context::Output) -> Result<()> {
        let out_time_base = octx
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| AppError::Recorder("audio output stream missing".to_string()))?;

        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.time_base, out_time_base);
            packet.write_interleaved(octx)?;
        }
        Ok(())
    }
}
