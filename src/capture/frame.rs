use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Monotonic capture timestamp
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub kind: FrameKind,
}

/// Payload layouts moving through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    /// Compressed MPEG-TS chunk, only produced in copy mode
    MpegTs,
}

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Decoded,
    Fallback,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata, timestamp: Instant) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp,
        }
    }

    /// Raw RGB24 frame decoded from the input
    pub fn rgb(sequence: u64, width: u32, height: u32, data: Bytes, timestamp: Instant) -> Self {
        Self::new(
            data,
            FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Rgb24,
                kind: FrameKind::Decoded,
            },
            timestamp,
        )
    }

    /// Compressed chunk carried through untouched in copy mode
    pub fn packet(sequence: u64, data: Bytes, timestamp: Instant) -> Self {
        Self::new(
            data,
            FrameMetadata {
                sequence,
                width: 0,
                height: 0,
                stride: 0,
                format: PixelFormat::MpegTs,
                kind: FrameKind::Decoded,
            },
            timestamp,
        )
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn kind(&self) -> FrameKind {
        self.meta.kind
    }

    pub fn is_fallback(&self) -> bool {
        self.meta.kind == FrameKind::Fallback
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("kind", &self.meta.kind)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
