//! Synthetic camera input for tests
//!
//! One second of 64x48 MPEG-4 video at 25 fps in Matroska, optionally with
//! 8 kHz mono PCM audio. Timestamps start [`START_SECS`] in, the way a
//! wall-clock stamped live input never starts at zero.

use std::path::Path;

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, encoder};
use ffmpeg::format::{self, sample, Pixel, Sample};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{ChannelLayout, Packet, Rational};

pub const FRAMES: i64 = 25;
pub const START_SECS: i64 = 10_000;
pub const AUDIO_RATE: i32 = 8000;
const FPS: i32 = 25;
const SAMPLES_PER_FRAME: usize = (AUDIO_RATE / FPS) as usize;

fn drain(
    enc: &mut encoder::Encoder,
    octx: &mut format::context::Output,
    index: usize,
    time_base: Rational,
) {
    let out_time_base = octx.stream(index).unwrap().time_base();
    let mut packet = Packet::empty();
    while enc.receive_packet(&mut packet).is_ok() {
        packet.set_stream(index);
        packet.rescale_ts(time_base, out_time_base);
        packet.write_interleaved(octx).unwrap();
    }
}

pub fn write_test_source(path: &Path, with_audio: bool) {
    ffmpeg::init().unwrap();
    let mut octx = format::output_as(&path, "matroska").unwrap();
    let global = octx
        .format()
        .flags()
        .contains(format::flag::Flags::GLOBAL_HEADER);

    let video_tb = Rational::new(1, FPS);
    let video_codec = encoder::find(codec::Id::MPEG4).unwrap();
    let mut venc = codec::context::Context::new_with_codec(video_codec)
        .encoder()
        .video()
        .unwrap();
    venc.set_width(64);
    venc.set_height(48);
    venc.set_format(Pixel::YUV420P);
    venc.set_time_base(video_tb);
    venc.set_frame_rate(Some(Rational::new(FPS, 1)));
    if global {
        venc.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }
    let mut venc = venc.open_as(video_codec).unwrap();
    let video_index = {
        let mut ost = octx.add_stream(video_codec).unwrap();
        ost.set_parameters(&venc);
        ost.set_time_base(video_tb);
        ost.index()
    };

    let audio_tb = Rational::new(1, AUDIO_RATE);
    let mut audio = with_audio.then(|| {
        let audio_codec = encoder::find(codec::Id::PCM_S16LE).unwrap();
        let mut aenc = codec::context::Context::new_with_codec(audio_codec)
            .encoder()
            .audio()
            .unwrap();
        aenc.set_rate(AUDIO_RATE);
        aenc.set_channel_layout(ChannelLayout::MONO);
        aenc.set_format(Sample::I16(sample::Type::Packed));
        aenc.set_time_base(audio_tb);
        let aenc = aenc.open_as(audio_codec).unwrap();
        let index = {
            let mut ost = octx.add_stream(audio_codec).unwrap();
            ost.set_parameters(&aenc);
            ost.set_time_base(audio_tb);
            ost.index()
        };
        (aenc, index)
    });

    octx.write_header().unwrap();

    let mut picture = Video::new(Pixel::YUV420P, 64, 48);
    let mut samples = AudioFrame::new(
        Sample::I16(sample::Type::Packed),
        SAMPLES_PER_FRAME,
        ChannelLayout::MONO,
    );
    samples.set_rate(AUDIO_RATE as u32);

    for i in 0..FRAMES {
        picture.data_mut(0).fill((i * 8) as u8);
        picture.data_mut(1).fill(128);
        picture.data_mut(2).fill(128);
        picture.set_pts(Some(START_SECS * FPS as i64 + i));
        venc.send_frame(&picture).unwrap();
        drain(&mut venc, &mut octx, video_index, video_tb);

        if let Some((aenc, index)) = audio.as_mut() {
            for (n, byte) in samples.data_mut(0).iter_mut().enumerate() {
                *byte = if (n / 16) % 2 == 0 { 0x10 } else { 0xf0 };
            }
            let pts = START_SECS * AUDIO_RATE as i64 + i * SAMPLES_PER_FRAME as i64;
            samples.set_pts(Some(pts));
            aenc.send_frame(&samples).unwrap();
            drain(aenc, &mut octx, *index, audio_tb);
        }
    }

    venc.send_eof().unwrap();
    drain(&mut venc, &mut octx, video_index, video_tb);
    if let Some((aenc, index)) = audio.as_mut() {
        aenc.send_eof().unwrap();
        drain(aenc, &mut octx, *index, audio_tb);
    }
    octx.write_trailer().unwrap();
}
