//! Recording file naming

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

/// Folder used when a camera name sanitizes to nothing
pub const FALLBACK_DIR: &str = "camera";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Make a camera name safe to use as a single path component
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        FALLBACK_DIR.to_string()
    } else {
        cleaned
    }
}

/// `<root>/<sanitized name>/<YYYY-MM-DD_HH-MM-SS>.mp4`
///
/// `name` falls back to `url` when blank.
pub fn recording_path<Tz: TimeZone>(
    root: &Path,
    name: &str,
    url: &str,
    started: &DateTime<Tz>,
) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    let label = if name.trim().is_empty() { url } else { name };
    root.join(sanitize_name(label))
        .join(format!("{}.mp4", started.format(TIMESTAMP_FORMAT)))
}
