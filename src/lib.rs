pub mod capture;
pub mod error;
pub mod media;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameKind, PixelFormat};
pub use error::{ConfigError, MediaError};
pub use pipeline::{ContinuityController, FrameSlot};

/// System configuration, immutable once the controller is built
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub encoder: EncoderConfig,
    pub engine: EngineConfig,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub timeout_secs: f64,
    pub sink_retry_ms: u64,
    pub write_timeout_ms: u64,
    pub fallback_message: String,
    pub fallback_image: Option<String>,
}

/// Encoder parameters. Opaque to the pipeline, interpreted only by the media engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub bitrate: String,
    pub preset: Preset,
    pub gop: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
    /// No re-encoding, compressed input is passed straight through
    Copy,
}

/// x264/x265 speed ladder, fastest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Ffmpeg,
    Gstreamer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            output: OutputConfig::default(),
            encoder: EncoderConfig::default(),
            engine: EngineConfig::default(),
            shutdown_grace_ms: Self::DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1920,
            height: 1080,
            fps: 25,
            timeout_secs: 15.0,
            sink_retry_ms: 1_000,
            write_timeout_ms: 2_000,
            fallback_message: "No frames received".into(),
            fallback_image: None,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            bitrate: "2M".into(),
            preset: Preset::Medium,
            gop: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".into(),
        }
    }
}

impl Config {
    pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

    /// Output tick interval derived from the target frame rate
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.output.fps.max(1) as f64)
    }

    /// Age at which the held frame is considered stale
    pub fn stale_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.output.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Bytes in one raw RGB24 frame at the output geometry
    pub fn raw_frame_size(&self) -> usize {
        self.output.width as usize * self.output.height as usize * 3
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.input.url.trim().is_empty() {
            return invalid("input url must not be empty".into());
        }
        if self.output.url.trim().is_empty() {
            return invalid("output url must not be empty".into());
        }
        if self.output.timeout_secs <= 0.0 || Duration::try_from_secs_f64(self.output.timeout_secs).is_err() {
            return invalid(format!(
                "timeout must be a positive number of seconds, got {}",
                self.output.timeout_secs
            ));
        }
        if self.output.fps == 0 || self.output.fps > 240 {
            return invalid(format!("fps must be in 1..=240, got {}", self.output.fps));
        }
        if self.output.width == 0 || self.output.height == 0 {
            return invalid("output geometry must be non-zero".into());
        }
        if self.output.width % 2 != 0 || self.output.height % 2 != 0 {
            // yuv420p needs even dimensions
            return invalid(format!(
                "output geometry must be even, got {}x{}",
                self.output.width, self.output.height
            ));
        }
        if self.encoder.gop == 0 {
            return invalid("gop must be a positive integer".into());
        }
        utils::parse_bitrate(&self.encoder.bitrate)?;
        if self.input.backoff.initial_ms == 0
            || self.input.backoff.max_ms < self.input.backoff.initial_ms
            || !(self.input.backoff.multiplier >= 1.0)
        {
            return invalid("backoff needs 0 < initial_ms <= max_ms and multiplier >= 1".into());
        }
        if self.input.connect_timeout_ms == 0 || self.input.read_timeout_ms == 0 {
            return invalid("input timeouts must be non-zero".into());
        }
        if self.engine.kind == EngineKind::Gstreamer {
            if !cfg!(feature = "gstreamer-pipeline") {
                return invalid("gstreamer engine requires the gstreamer-pipeline feature".into());
            }
            if self.encoder.codec == Codec::Copy {
                return invalid("copy codec is only supported by the ffmpeg engine".into());
            }
        }
        Ok(())
    }
}
