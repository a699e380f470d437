//! Placeholder "no signal" frames

use std::path::Path;

use bytes::Bytes;
use image::{imageops::FilterType, Rgb, RgbImage};
use tokio::time::Instant;
use tracing::info;

use crate::capture::frame::{FrameKind, FrameMetadata, PixelFormat};
use crate::output::font::{self, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};
use crate::{ConfigError, Frame};

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Renders a message centered on a black (or custom) background.
///
/// Output is a pure function of the message and the generator geometry, so the
/// same text always yields byte-identical pixels. No shared state is touched.
#[derive(Debug, Clone)]
pub struct FallbackFrameGenerator {
    width: u32,
    height: u32,
    background: Option<RgbImage>,
}

impl FallbackFrameGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: None,
        }
    }

    /// Use a still image (resized to the output geometry) instead of black
    pub fn with_background_image(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| ConfigError::FallbackImage {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let resized = image::imageops::resize(&image.to_rgb8(), self.width, self.height, FilterType::Triangle);
        info!(path = %path.display(), "Loaded fallback background image");
        self.background = Some(resized);
        Ok(self)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Render `message` into a new frame stamped with `timestamp`
    pub fn generate(&self, message: &str, timestamp: Instant) -> Frame {
        let mut canvas = match &self.background {
            Some(background) => background.clone(),
            None => RgbImage::new(self.width, self.height),
        };
        self.draw_text(&mut canvas, message);

        Frame::new(
            Bytes::from(canvas.into_raw()),
            FrameMetadata {
                sequence: 0,
                width: self.width,
                height: self.height,
                stride: self.width * 3,
                format: PixelFormat::Rgb24,
                kind: FrameKind::Fallback,
            },
            timestamp,
        )
    }

    /// Integer scale that makes the text span about half the frame width
    fn scale_for(&self, message: &str) -> u32 {
        let text_width = font::text_width(message).max(1);
        let by_width = (self.width / 2) / text_width;
        let by_height = self.height / (GLYPH_HEIGHT * 4);
        by_width.min(by_height).max(1)
    }

    fn draw_text(&self, canvas: &mut RgbImage, message: &str) {
        let scale = self.scale_for(message);
        let text_w = font::text_width(message) * scale;
        let text_h = GLYPH_HEIGHT * scale;
        let origin_x = self.width.saturating_sub(text_w) / 2;
        let origin_y = self.height.saturating_sub(text_h) / 2;

        for (index, c) in message.chars().enumerate() {
            let glyph = font::glyph(c);
            let glyph_x = origin_x + index as u32 * GLYPH_ADVANCE * scale;

            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    let x0 = glyph_x + col * scale;
                    let y0 = origin_y + row as u32 * scale;
                    for y in y0..(y0 + scale).min(self.height) {
                        for x in x0..(x0 + scale).min(self.width) {
                            canvas.put_pixel(x, y, TEXT_COLOR);
                        }
                    }
                }
            }
        }
    }
}
