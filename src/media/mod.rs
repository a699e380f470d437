//! Media engine seam: opening the input for decoding and the output for encoding.
//!
//! The pipeline only ever sees [`Frame`]s; codecs, transports and muxers live
//! behind these traits.

pub mod ffmpeg;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;

use async_trait::async_trait;

use crate::{Frame, MediaError};

/// Opens connections to the upstream source
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    type Stream: FrameStream;

    /// Open the source. Implementations bound this by their own connect timeout.
    async fn open(&self) -> Result<Self::Stream, MediaError>;
}

/// A live, decoding connection to the source
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Decode the next frame. Blocks until data arrives, bounded by a read timeout.
    async fn next_frame(&mut self) -> Result<Frame, MediaError>;

    /// Tear down the connection
    async fn close(&mut self) {}
}

/// Opens connections to the downstream sink
#[async_trait]
pub trait SinkConnector: Send + Sync + 'static {
    type Sink: FrameSink;

    async fn open(&self) -> Result<Self::Sink, MediaError>;
}

/// Encode-and-send side of the output
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn write(&mut self, frame: &Frame) -> Result<(), MediaError>;

    /// Flush and close the sink
    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }
}
