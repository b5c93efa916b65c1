//! Extra FFmpeg parameter parsing
//!
//! Cameras carry a free-form string such as
//! `-fstimeout=5000000 -cthreads=2 -fuser_agent="My/1.0"`. Tokens prefixed
//! `-f` go to the input (format) dictionary, tokens prefixed `-c` go to the
//! decoder dictionary. Anything else is ignored.

use std::collections::BTreeMap;

/// Parsed extra parameters, split by the stage they apply to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FfmpegParams {
    /// Options for opening the input
    pub format: BTreeMap<String, String>,
    /// Options for opening the video decoder
    pub codec: BTreeMap<String, String>,
}

impl FfmpegParams {
    pub fn is_empty(&self) -> bool {
        self.format.is_empty() && self.codec.is_empty()
    }
}

/// Parse a whitespace-separated parameter string.
///
/// Malformed tokens (no `=`, empty key or value, unknown prefix) are skipped.
pub fn parse_ffmpeg_params(input: &str) -> FfmpegParams {
    let mut params = FfmpegParams::default();

    for token in input.split_whitespace() {
        let Some(rest) = token.strip_prefix('-') else {
            continue;
        };
        let mut chars = rest.chars();
        let target = match chars.next() {
            Some('f') => &mut params.format,
            Some('c') => &mut params.codec,
            _ => continue,
        };
        let Some((key, value)) = chars.as_str().split_once('=') else {
            continue;
        };
        let value = strip_matching_quotes(value);
        if key.is_empty() || value.is_empty() {
            continue;
        }
        target.insert(key.to_string(), value.to_string());
    }

    params
}

fn strip_matching_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
