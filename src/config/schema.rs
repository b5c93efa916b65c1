use std::path::PathBuf;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Folder under the home directory that holds recordings by default
pub const RECORDINGS_DIR_NAME: &str = "CamWall-Recordings";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configured cameras, in display order
    pub cameras: Vec<CameraConfig>,
    /// Health overlay switches
    pub diagnostics: DiagnosticsConfig,
    /// Live audio playback
    pub audio: AudioConfig,
    /// Recordings root override (default: `~/CamWall-Recordings`)
    pub recordings_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Resolve the recordings root directory
    pub fn recordings_root(&self) -> PathBuf {
        match &self.recordings_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(RECORDINGS_DIR_NAME),
        }
    }

    /// Find a camera by its stable key
    pub fn camera(&self, key: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.key() == key)
    }
}

/// One camera record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Stable identifier (hex), assigned by [`ensure_camera_ids`]
    pub id: String,
    pub name: String,
    /// Disabled cameras are kept in the list but never opened
    pub disabled: bool,
    pub url: String,
    /// Force interleaved TCP transport for RTSP
    pub rtsp_tcp: bool,
    /// Demuxer probe size in bytes (0 = default 5000000)
    pub probesize: u64,
    /// Demuxer analyze duration in microseconds (0 = library default)
    pub analyze_us: u64,
    /// Decoder thread count (0 = automatic)
    pub threads: u32,
    /// Hardware acceleration hint; informational only
    pub hwaccel: String,
    /// Extra `-f<key>=<value>` / `-c<key>=<value>` parameters
    pub ffmpeg_params: String,
    /// Skip audio decode and playback
    pub mute: bool,
    /// Socket I/O timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            disabled: false,
            url: String::new(),
            rtsp_tcp: false,
            probesize: 0,
            analyze_us: 0,
            threads: 0,
            hwaccel: String::new(),
            ffmpeg_params: String::new(),
            mute: false,
            timeout_ms: 5000,
        }
    }
}

impl CameraConfig {
    /// Create a camera record for a URL
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set TCP transport preference
    pub fn with_tcp(mut self, tcp: bool) -> Self {
        self.rtsp_tcp = tcp;
        self
    }

    /// Key used to match sessions: id, then name, then URL
    pub fn key(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else if !self.name.is_empty() {
            &self.name
        } else {
            &self.url
        }
    }

    /// Name shown in logs and used for recording folders
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

/// Health overlay switches.
///
/// Byte and PTS-gap accounting only runs when an overlay that shows it is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub health_chip: bool,
    pub show_fps: bool,
    pub show_bitrate: bool,
    pub show_drops: bool,
    pub show_cpu: bool,
}

impl DiagnosticsConfig {
    /// Everything on
    pub fn all() -> Self {
        Self {
            health_chip: true,
            show_fps: true,
            show_bitrate: true,
            show_drops: true,
            show_cpu: true,
        }
    }

    /// Whether payload bytes and PTS gaps should be accumulated
    pub fn collects_stream_stats(&self) -> bool {
        self.health_chip || self.show_bitrate || self.show_drops
    }
}

/// Live audio playback configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Enable playback at all
    pub enabled: bool,
    /// ALSA device name
    pub device: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "default".to_string(),
        }
    }
}

/// Give every camera without an id a random 16-hex-char one.
///
/// Returns true when at least one id was assigned.
pub fn ensure_camera_ids(cameras: &mut [CameraConfig]) -> bool {
    let mut changed = false;
    for camera in cameras.iter_mut().filter(|c| c.id.is_empty()) {
        camera.id = generate_id();
        changed = true;
    }
    changed
}

fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
