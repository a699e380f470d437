//! GStreamer-based media engine: appsink on the input, appsrc on the output

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::media::ffmpeg::output_format;
use crate::media::{FrameSink, FrameSource, FrameStream, SinkConnector};
use crate::{utils, Codec, Config, ConfigError, EncoderConfig, Frame, MediaError};

/// Initialize GStreamer once at startup
pub fn init() -> Result<(), ConfigError> {
    gst::init().map_err(|e| ConfigError::Engine(format!("Failed to initialize GStreamer: {e}")))
}

fn launch(description: &str, url: &str) -> Result<gst::Pipeline, MediaError> {
    debug!("Pipeline: {}", description);
    gst::parse::launch(description)
        .map_err(|e| MediaError::connect(url, e))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| MediaError::connect(url, "Failed to create pipeline"))
}

/// First error posted on the pipeline bus, if any
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(format!(
            "Error from {:?}: {} ({:?})",
            err.src().map(|s| s.path_string()),
            err.error(),
            err.debug()
        )),
        _ => None,
    }
}

fn stop(pipeline: &gst::Pipeline) {
    if let Err(e) = pipeline.set_state(gst::State::Null) {
        warn!("Failed to stop pipeline: {:?}", e);
    }
}

/// Decodes the input URL into RGB frames pulled from an appsink
#[derive(Debug, Clone)]
pub struct GstSource {
    url: String,
    width: u32,
    height: u32,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl GstSource {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            url: config.input.url.clone(),
            width: config.output.width,
            height: config.output.height,
            connect_timeout: Duration::from_millis(config.input.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.input.read_timeout_ms),
        })
    }

    /// Build the decode pipeline string
    pub fn build_pipeline_string(&self) -> String {
        let lower = self.url.to_ascii_lowercase();
        let source = if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            // TCP interleaved transport survives lossy links better than UDP
            format!("rtspsrc location={} protocols=tcp latency=200 ! decodebin", self.url)
        } else {
            format!("uridecodebin uri={}", self.url)
        };

        format!(
            "{} ! \
             videoconvert ! \
             videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink",
            source, self.width, self.height
        )
    }
}

#[async_trait]
impl FrameSource for GstSource {
    type Stream = GstStream;

    async fn open(&self) -> Result<GstStream, MediaError> {
        let pipeline = launch(&self.build_pipeline_string(), &self.url)?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| MediaError::connect(&self.url, "Failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| MediaError::connect(&self.url, "Failed to cast to AppSink"))?;

        // Only the newest decoded frame matters
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MediaError::connect(&self.url, format!("Failed to start pipeline: {e:?}")))?;
        info!(url = %self.url, "GStreamer input pipeline started");

        Ok(GstStream {
            pipeline,
            appsink,
            sequence: 0,
            next_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        })
    }
}

pub struct GstStream {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    sequence: u64,
    next_timeout: Duration,
    read_timeout: Duration,
}

#[async_trait]
impl FrameStream for GstStream {
    async fn next_frame(&mut self) -> Result<Frame, MediaError> {
        if let Some(error) = bus_error(&self.pipeline) {
            return Err(MediaError::Decode(error));
        }

        let appsink = self.appsink.clone();
        let wait = gst::ClockTime::from_mseconds(self.next_timeout.as_millis() as u64);
        let sample = tokio::task::spawn_blocking(move || appsink.try_pull_sample(wait))
            .await
            .map_err(|e| MediaError::Decode(e.to_string()))?;

        let Some(sample) = sample else {
            if self.appsink.is_eos() {
                return Err(MediaError::EndOfStream);
            }
            return Err(MediaError::Timeout {
                op: "sample pull",
                after: self.next_timeout,
            });
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| MediaError::Decode("Sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| MediaError::Decode("Failed to map buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| MediaError::Decode("Sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| MediaError::Decode("Failed to parse video info from caps".into()))?;

        self.sequence += 1;
        self.next_timeout = self.read_timeout;
        Ok(Frame::rgb(
            self.sequence,
            video_info.width(),
            video_info.height(),
            Bytes::copy_from_slice(map.as_slice()),
            Instant::now(),
        ))
    }

    async fn close(&mut self) {
        stop(&self.pipeline);
    }
}

impl Drop for GstStream {
    fn drop(&mut self) {
        stop(&self.pipeline);
    }
}

/// Encodes frames pushed into an appsrc and publishes them to the output URL
#[derive(Debug, Clone)]
pub struct GstSinkConnector {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    encoder: EncoderConfig,
    kbps: u64,
}

impl GstSinkConnector {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if config.encoder.codec == Codec::Copy {
            return Err(ConfigError::Invalid("copy codec is not supported by the gstreamer engine".into()));
        }
        let connector = Self {
            url: config.output.url.clone(),
            width: config.output.width,
            height: config.output.height,
            fps: config.output.fps,
            encoder: config.encoder.clone(),
            kbps: (utils::parse_bitrate(&config.encoder.bitrate)? / 1_000).max(1),
        };
        connector.build_pipeline_string()?;
        Ok(connector)
    }

    /// Build the encode pipeline string
    pub fn build_pipeline_string(&self) -> Result<String, ConfigError> {
        let (encoder, parser) = match self.encoder.codec {
            Codec::H264 => ("x264enc", "h264parse"),
            Codec::H265 => ("x265enc", "h265parse"),
            Codec::Copy => return Err(ConfigError::Invalid("copy codec needs the ffmpeg engine".into())),
        };

        let sink = match output_format(&self.url) {
            Some("rtsp") => format!("rtspclientsink location={} protocols=tcp", self.url),
            Some("flv") if self.encoder.codec == Codec::H264 => {
                format!("flvmux streamable=true ! rtmpsink location={}", self.url)
            }
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "gstreamer engine cannot publish {} with {:?}",
                    self.url, self.encoder.codec
                )))
            }
        };

        Ok(format!(
            "appsrc name=appsrc caps=video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
             videoconvert ! \
             {} bitrate={} speed-preset={} key-int-max={} tune=zerolatency ! \
             {} ! \
             {}",
            self.width,
            self.height,
            self.fps,
            encoder,
            self.kbps,
            self.encoder.preset.as_str(),
            self.encoder.gop,
            parser,
            sink
        ))
    }
}

#[async_trait]
impl SinkConnector for GstSinkConnector {
    type Sink = GstSink;

    async fn open(&self) -> Result<GstSink, MediaError> {
        let description = self
            .build_pipeline_string()
            .map_err(|e| MediaError::Unsupported(e.to_string()))?;
        let pipeline = launch(&description, &self.url)?;

        let appsrc = pipeline
            .by_name("appsrc")
            .ok_or_else(|| MediaError::connect(&self.url, "Failed to find appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| MediaError::connect(&self.url, "Failed to cast to AppSrc"))?;

        // Configure appsrc
        appsrc.set_property("is-live", true);
        appsrc.set_property("block", false);
        appsrc.set_property("do-timestamp", true);
        appsrc.set_property("format", gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MediaError::connect(&self.url, format!("Failed to start pipeline: {e:?}")))?;
        info!(url = %self.url, "GStreamer output pipeline started");

        Ok(GstSink { pipeline, appsrc })
    }
}

pub struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
}

#[async_trait]
impl FrameSink for GstSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), MediaError> {
        if let Some(error) = bus_error(&self.pipeline) {
            return Err(MediaError::Send(error));
        }

        // Bytes is refcounted, so the buffer wraps it without copying
        let buffer = gst::Buffer::from_slice(frame.data.clone());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| MediaError::Send(format!("Failed to push buffer: {e:?}")))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        let _ = self.appsrc.end_of_stream();

        // Let the encoder drain before tearing the pipeline down
        if let Some(bus) = self.pipeline.bus() {
            let _ = tokio::task::spawn_blocking(move || {
                bus.timed_pop_filtered(
                    gst::ClockTime::from_seconds(1),
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                )
            })
            .await;
        }
        stop(&self.pipeline);
        Ok(())
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        stop(&self.pipeline);
    }
}
