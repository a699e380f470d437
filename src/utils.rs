use std::path::Path;
use std::process::Stdio;

use config::{Environment, File, FileFormat};
use tokio::process::Command;
use tracing::info;

use crate::{Config, ConfigError};

/// Environment prefix for overrides, e.g. `HOLDOVER__OUTPUT__FPS=30`
pub const ENV_PREFIX: &str = "HOLDOVER";

/// Layer defaults, an optional TOML file and `HOLDOVER__*` environment variables.
///
/// A missing file is an error only when `path` was given explicitly.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let defaults = config::Config::try_from(&Config::default())?;
    let mut builder = config::Config::builder().add_source(defaults);

    builder = match path {
        Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml).required(true)),
        None => builder.add_source(File::with_name("holdover").format(FileFormat::Toml).required(false)),
    };

    let settings = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Parse a bitrate such as `2M`, `800k` or `1500000` into bits per second
pub fn parse_bitrate(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("bitrate {value:?} is not a number with optional k/M/G suffix"));

    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1_000),
        Some('m' | 'M') => (&value[..value.len() - 1], 1_000_000),
        Some('g' | 'G') => (&value[..value.len() - 1], 1_000_000_000),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let bits = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)?;
    if bits == 0 {
        return Err(invalid());
    }
    Ok(bits)
}

/// Check that the ffmpeg binary runs; returns its version banner
pub async fn detect_ffmpeg(program: &str) -> Result<String, ConfigError> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| ConfigError::Engine(format!("cannot run {program}: {e}")))?;

    if !output.status.success() {
        return Err(ConfigError::Engine(format!(
            "{program} -version exited with {}",
            output.status
        )));
    }

    let banner = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    info!("Found {}", banner);
    Ok(banner)
}
