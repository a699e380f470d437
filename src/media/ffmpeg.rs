//! Media engine backed by ffmpeg child processes.
//!
//! Input: ffmpeg decodes the source and writes raw RGB24 frames (or, in copy
//! mode, an MPEG-TS byte stream) to its stdout. Output: ffmpeg reads the same
//! layout on stdin, encodes and publishes to the output URL.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::media::{FrameSink, FrameSource, FrameStream, SinkConnector};
use crate::{Codec, Config, EncoderConfig, Frame, MediaError, PixelFormat};

const COMMON_ARGS: [&str; 3] = ["-hide_banner", "-loglevel", "error"];
const PASSTHROUGH_SCRATCH: usize = 64 * 1024;

/// Container format implied by the output URL scheme, `None` lets ffmpeg guess
pub fn output_format(url: &str) -> Option<&'static str> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase())?;
    match scheme.as_str() {
        "rtsp" | "rtsps" => Some("rtsp"),
        "rtmp" | "rtmps" => Some("flv"),
        "srt" | "udp" => Some("mpegts"),
        _ => None,
    }
}

fn is_rtsp(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

/// Decoder arguments for the input process
pub fn input_args(url: &str, width: u32, height: u32, codec: Codec) -> Vec<String> {
    let mut args: Vec<String> = COMMON_ARGS.iter().map(|s| s.to_string()).collect();
    if is_rtsp(url) {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    }
    args.extend(["-i".into(), url.into(), "-an".into()]);

    match codec {
        Codec::Copy => args.extend(["-c:v", "copy", "-f", "mpegts"].map(String::from)),
        Codec::H264 | Codec::H265 => {
            args.extend([
                "-vf".into(),
                format!("scale={width}:{height}"),
                "-pix_fmt".into(),
                "rgb24".into(),
                "-f".into(),
                "rawvideo".into(),
            ]);
        }
    }
    args.push("pipe:1".into());
    args
}

/// Encoder arguments for the output process
pub fn output_args(url: &str, width: u32, height: u32, fps: u32, encoder: &EncoderConfig) -> Vec<String> {
    let mut args: Vec<String> = COMMON_ARGS.iter().map(|s| s.to_string()).collect();

    match encoder.codec {
        Codec::Copy => {
            args.extend(["-f", "mpegts", "-i", "pipe:0", "-an", "-c:v", "copy"].map(String::from));
        }
        Codec::H264 | Codec::H265 => {
            let library = if encoder.codec == Codec::H264 { "libx264" } else { "libx265" };
            args.extend([
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "rgb24".into(),
                "-s".into(),
                format!("{width}x{height}"),
                "-r".into(),
                fps.to_string(),
                "-i".into(),
                "pipe:0".into(),
                "-an".into(),
                "-c:v".into(),
                library.into(),
                "-b:v".into(),
                encoder.bitrate.clone(),
                "-preset".into(),
                encoder.preset.as_str().into(),
                "-g".into(),
                encoder.gop.to_string(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]);
        }
    }

    match output_format(url) {
        Some("rtsp") => args.extend(["-f", "rtsp", "-rtsp_transport", "tcp"].map(String::from)),
        Some(format) => args.extend(["-f".into(), format.into()]),
        None => {}
    }
    args.push(url.into());
    args
}

fn spawn(program: &str, args: &[String], url: &str, stdin: Stdio, stdout: Stdio) -> Result<Child, MediaError> {
    debug!(program, ?args, "Spawning ffmpeg");
    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| MediaError::connect(url, format!("failed to spawn {program}: {e}")))
}

/// Forward ffmpeg's stderr into the log
fn forward_stderr(stderr: Option<ChildStderr>, role: &'static str) {
    let Some(stderr) = stderr else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: "holdover::ffmpeg", role, "{}", line);
        }
    });
}

/// Opens the input URL through an ffmpeg decoder process
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    program: String,
    url: String,
    width: u32,
    height: u32,
    codec: Codec,
    frame_size: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    /// Copy mode chunk length
    chunk_period: Duration,
}

impl FfmpegSource {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.engine.ffmpeg_path.clone(),
            url: config.input.url.clone(),
            width: config.output.width,
            height: config.output.height,
            codec: config.encoder.codec,
            frame_size: config.raw_frame_size(),
            connect_timeout: Duration::from_millis(config.input.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.input.read_timeout_ms),
            // Two ticks per chunk so the driver sees every chunk before it is replaced
            chunk_period: config.tick_interval() * 2,
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    type Stream = FfmpegStream;

    async fn open(&self) -> Result<FfmpegStream, MediaError> {
        let args = input_args(&self.url, self.width, self.height, self.codec);
        let mut child = spawn(&self.program, &args, &self.url, Stdio::null(), Stdio::piped())?;
        forward_stderr(child.stderr.take(), "input");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::connect(&self.url, "ffmpeg stdout not captured"))?;

        Ok(FfmpegStream {
            child,
            stdout,
            width: self.width,
            height: self.height,
            frame_size: self.frame_size,
            passthrough: self.codec == Codec::Copy,
            sequence: 0,
            // ffmpeg connects lazily, so the first frame gets the connect budget
            next_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            chunk_period: self.chunk_period,
            scratch: Vec::new(),
        })
    }
}

pub struct FfmpegStream {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_size: usize,
    passthrough: bool,
    sequence: u64,
    next_timeout: Duration,
    read_timeout: Duration,
    chunk_period: Duration,
    scratch: Vec<u8>,
}

impl FfmpegStream {
    async fn read_raw(&mut self) -> Result<Frame, MediaError> {
        let mut buf = vec![0u8; self.frame_size];

        match tokio::time::timeout(self.next_timeout, self.stdout.read_exact(&mut buf)).await {
            Err(_) => Err(MediaError::Timeout {
                op: "frame read",
                after: self.next_timeout,
            }),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(MediaError::EndOfStream),
            Ok(Err(e)) => Err(MediaError::Decode(e.to_string())),
            Ok(Ok(_)) => {
                self.sequence += 1;
                Ok(Frame::rgb(
                    self.sequence,
                    self.width,
                    self.height,
                    Bytes::from(buf),
                    Instant::now(),
                ))
            }
        }
    }

    /// Collect roughly one chunk period of compressed bytes
    async fn read_chunk(&mut self) -> Result<Frame, MediaError> {
        if self.scratch.is_empty() {
            self.scratch = vec![0u8; PASSTHROUGH_SCRATCH];
        }
        let started = Instant::now();
        let mut chunk = BytesMut::new();

        loop {
            let deadline = if chunk.is_empty() {
                started + self.next_timeout
            } else {
                started + self.chunk_period
            };

            let read = tokio::time::timeout_at(deadline, self.stdout.read(&mut self.scratch)).await;
            match read {
                Ok(Ok(n)) if n > 0 => chunk.extend_from_slice(&self.scratch[..n]),
                Ok(Err(e)) => return Err(MediaError::Decode(e.to_string())),
                // EOF or chunk period over: hand out what we have
                _ if !chunk.is_empty() => break,
                Ok(Ok(_)) => return Err(MediaError::EndOfStream),
                Err(_) => {
                    return Err(MediaError::Timeout {
                        op: "chunk read",
                        after: self.next_timeout,
                    })
                }
            }
        }

        self.sequence += 1;
        Ok(Frame::packet(self.sequence, chunk.freeze(), Instant::now()))
    }
}

#[async_trait]
impl FrameStream for FfmpegStream {
    async fn next_frame(&mut self) -> Result<Frame, MediaError> {
        let frame = if self.passthrough {
            self.read_chunk().await
        } else {
            self.read_raw().await
        }?;
        self.next_timeout = self.read_timeout;
        Ok(frame)
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "ffmpeg input already gone");
        }
    }
}

/// Opens the output URL through an ffmpeg encoder process
#[derive(Debug, Clone)]
pub struct FfmpegSinkConnector {
    program: String,
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    encoder: EncoderConfig,
    frame_size: usize,
}

impl FfmpegSinkConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.engine.ffmpeg_path.clone(),
            url: config.output.url.clone(),
            width: config.output.width,
            height: config.output.height,
            fps: config.output.fps,
            encoder: config.encoder.clone(),
            frame_size: config.raw_frame_size(),
        }
    }
}

#[async_trait]
impl SinkConnector for FfmpegSinkConnector {
    type Sink = FfmpegSink;

    async fn open(&self) -> Result<FfmpegSink, MediaError> {
        let args = output_args(&self.url, self.width, self.height, self.fps, &self.encoder);
        let mut child = spawn(&self.program, &args, &self.url, Stdio::piped(), Stdio::null())?;
        forward_stderr(child.stderr.take(), "output");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::connect(&self.url, "ffmpeg stdin not captured"))?;

        Ok(FfmpegSink {
            child,
            stdin: Some(stdin),
            expected_len: self.frame_size,
        })
    }
}

pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    expected_len: usize,
}

#[async_trait]
impl FrameSink for FfmpegSink {
    async fn write(&mut self, frame: &Frame) -> Result<(), MediaError> {
        if frame.meta.format == PixelFormat::Rgb24 && frame.data.len() != self.expected_len {
            return Err(MediaError::Send(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data.len(),
                self.expected_len
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::Send("sink already closed".into()))?;
        stdin
            .write_all(&frame.data)
            .await
            .map_err(|e| MediaError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        // EOF on stdin lets ffmpeg flush the encoder and close the connection
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let status = self.child.wait().await?;
        debug!(%status, "ffmpeg output exited");
        Ok(())
    }
}
