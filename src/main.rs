//! Holdover: keeps an output stream alive while the input comes and goes

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use holdover::media::ffmpeg::{FfmpegSinkConnector, FfmpegSource};
use holdover::media::{FrameSource, SinkConnector};
use holdover::output::FallbackFrameGenerator;
use holdover::{utils, Codec, Config, ContinuityController, EngineKind, Preset};

/// Relay a video stream, replaying the last good frame while the input is down
#[derive(Debug, Parser)]
#[command(name = "holdover", version, about)]
struct Cli {
    /// Input stream URL
    input_url: String,

    /// Output stream URL
    output_url: String,

    /// Seconds without input before the "no signal" frame is shown
    #[arg(long)]
    timeout: Option<f64>,

    /// Output video codec
    #[arg(long, value_enum)]
    codec: Option<Codec>,

    /// Output bitrate, e.g. 2M or 800k
    #[arg(long)]
    bitrate: Option<String>,

    /// Encoder speed/quality preset
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Keyframe interval in frames
    #[arg(long)]
    gop: Option<u32>,

    /// Output frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Output frame width
    #[arg(long)]
    width: Option<u32>,

    /// Output frame height
    #[arg(long)]
    height: Option<u32>,

    /// Media engine
    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<String>,

    /// Image shown instead of a black background while the input is down
    #[arg(long)]
    fallback_image: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flags take precedence over file and environment settings
    fn apply(self, config: &mut Config) {
        config.input.url = self.input_url;
        config.output.url = self.output_url;
        if let Some(timeout) = self.timeout {
            config.output.timeout_secs = timeout;
        }
        if let Some(codec) = self.codec {
            config.encoder.codec = codec;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate = bitrate;
        }
        if let Some(preset) = self.preset {
            config.encoder.preset = preset;
        }
        if let Some(gop) = self.gop {
            config.encoder.gop = gop;
        }
        if let Some(fps) = self.fps {
            config.output.fps = fps;
        }
        if let Some(width) = self.width {
            config.output.width = width;
        }
        if let Some(height) = self.height {
            config.output.height = height;
        }
        if let Some(engine) = self.engine {
            config.engine.kind = engine;
        }
        if let Some(ffmpeg) = self.ffmpeg {
            config.engine.ffmpeg_path = ffmpeg;
        }
        if let Some(image) = self.fallback_image {
            config.output.fallback_image = Some(image);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();

    // Everything up to here is startup configuration; failures are fatal
    let mut config = utils::load_config(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    let config = Arc::new(config);

    let mut generator = FallbackFrameGenerator::new(config.output.width, config.output.height);
    if let Some(path) = &config.output.fallback_image {
        generator = generator.with_background_image(path)?;
    }

    info!("Holdover launching...");
    info!(input = %config.input.url, output = %config.output.url, "Relay configured");

    let report = match config.engine.kind {
        EngineKind::Ffmpeg => {
            utils::detect_ffmpeg(&config.engine.ffmpeg_path).await?;
            let source = FfmpegSource::from_config(&config);
            let connector = FfmpegSinkConnector::from_config(&config);
            run(config, source, connector, generator).await
        }
        #[cfg(feature = "gstreamer-pipeline")]
        EngineKind::Gstreamer => {
            holdover::media::gst::init()?;
            let source = holdover::media::gst::GstSource::from_config(&config)?;
            let connector = holdover::media::gst::GstSinkConnector::from_config(&config)?;
            run(config, source, connector, generator).await
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        EngineKind::Gstreamer => return Err(eyre!("built without the gstreamer-pipeline feature")),
    };

    if !report.clean() {
        error!("Pipeline did not shut down cleanly");
        return Err(eyre!("shutdown grace period exceeded"));
    }

    info!("Holdover shutting down");
    Ok(())
}

async fn run<S, C>(
    config: Arc<Config>,
    source: S,
    connector: C,
    generator: FallbackFrameGenerator,
) -> holdover::pipeline::RunReport
where
    S: FrameSource,
    C: SinkConnector,
{
    let controller = ContinuityController::new(config, source, connector, generator);
    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("holdover=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}
