//! Option dictionaries for opening inputs and decoders

use std::collections::BTreeMap;

use ffmpeg_next::codec::threading;
use ffmpeg_next::codec::Id as CodecId;
use ffmpeg_next::Dictionary;

use crate::config::{CameraConfig, FfmpegParams};

/// Probe size used when the camera does not set one
pub const DEFAULT_PROBESIZE: u64 = 5_000_000;

pub type OptionMap = BTreeMap<String, String>;

fn set(map: &mut OptionMap, key: &str, value: impl ToString) {
    map.insert(key.to_string(), value.to_string());
}

/// Low-latency, corruption-tolerant input defaults, overridden by `-f` params
pub fn input_options(config: &CameraConfig, params: &FfmpegParams) -> OptionMap {
    let mut opts = OptionMap::new();

    if config.rtsp_tcp {
        set(&mut opts, "rtsp_transport", "tcp");
        set(&mut opts, "rtsp_flags", "prefer_tcp");
    }
    set(&mut opts, "buffer_size", 1_048_576);
    set(&mut opts, "fflags", "+nobuffer+discardcorrupt+genpts");
    set(&mut opts, "flags", "+low_delay");
    set(&mut opts, "max_delay", 500_000);
    set(&mut opts, "use_wallclock_as_timestamps", 1);
    set(&mut opts, "reorder_queue_size", 0);

    let probesize = if config.probesize > 0 {
        config.probesize
    } else {
        DEFAULT_PROBESIZE
    };
    set(&mut opts, "probesize", probesize);
    if config.analyze_us > 0 {
        set(&mut opts, "analyzeduration", config.analyze_us);
    }
    if config.timeout_ms > 0 {
        set(&mut opts, "timeout", config.timeout_ms * 1000);
    }

    for (k, v) in &params.format {
        opts.insert(k.clone(), v.clone());
    }
    opts
}

/// Error-tolerant software decoder defaults, overridden by `-c` params
pub fn decoder_options(params: &FfmpegParams) -> OptionMap {
    let mut opts = OptionMap::new();
    set(&mut opts, "err_detect", "careful");
    set(&mut opts, "flags2", "+showall");
    set(&mut opts, "skip_frame", "default");

    for (k, v) in &params.codec {
        opts.insert(k.clone(), v.clone());
    }
    opts
}

/// Decoder thread count: the configured value, else single-threaded HEVC
pub fn decoder_threads(config: &CameraConfig, codec: CodecId) -> Option<usize> {
    if config.threads > 0 {
        Some(config.threads as usize)
    } else if codec == CodecId::HEVC {
        Some(1)
    } else {
        None
    }
}

/// Frame-threaded decoding with [`decoder_threads`] workers.
///
/// `threading::Config::count` leaves the kind at `None`, which libavcodec
/// treats as threading off.
pub fn decoder_threading(config: &CameraConfig, codec: CodecId) -> Option<threading::Config> {
    decoder_threads(config, codec).map(|count| threading::Config {
        kind: threading::Type::Frame,
        count,
        ..Default::default()
    })
}

pub fn to_dictionary(opts: &OptionMap) -> Dictionary<'static> {
    let mut dict = Dictionary::new();
    for (k, v) in opts {
        dict.set(k, v);
    }
    dict
}

/// `k=v k=v` rendering for logs
pub fn describe(opts: &OptionMap) -> String {
    opts.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
