//! Frame decoders and simple render sinks

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::time::Duration;
use tokio::time::Instant;

use super::{DisplayFrame, FrameDecoder, PixelFormat, RenderSink};
use crate::error::{DecodeError, SinkError};
use crate::pipeline::types::{RGB_BYTES_PER_PIXEL, VideoHeader};

/// Reshapes raw RGB24 payloads into frames, checking the byte count
#[derive(Debug, Default, Clone, Copy)]
pub struct RgbFrameDecoder;

impl FrameDecoder for RgbFrameDecoder {
    fn decode(&self, raw: Bytes, width: u32, height: u32) -> Result<DisplayFrame, DecodeError> {
        let expected = width as usize * height as usize * RGB_BYTES_PER_PIXEL;
        if raw.len() != expected {
            return Err(DecodeError(format!(
                "{}x{} RGB frame needs {expected} bytes, got {}",
                width,
                height,
                raw.len()
            )));
        }
        Ok(DisplayFrame {
            data: raw,
            width,
            height,
            format: PixelFormat::Rgb24,
        })
    }
}

/// Passes compressed images through untouched for the renderer to decode
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodedFrameDecoder;

impl FrameDecoder for EncodedFrameDecoder {
    fn decode(&self, raw: Bytes, width: u32, height: u32) -> Result<DisplayFrame, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError("empty image payload".into()));
        }
        Ok(DisplayFrame {
            data: raw,
            width,
            height,
            format: PixelFormat::Encoded,
        })
    }
}

/// Discards every frame
#[derive(Debug, Default)]
pub struct NullRenderSink;

#[async_trait]
impl RenderSink for NullRenderSink {
    async fn show(&mut self, _frame: DisplayFrame) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Logs the effective frame rate instead of drawing
pub struct LogRenderSink {
    shown: u64,
    window_frames: u64,
    window_start: Option<Instant>,
    report_every: Duration,
}

impl LogRenderSink {
    pub fn new(report_every: Duration) -> Self {
        Self {
            shown: 0,
            window_frames: 0,
            window_start: None,
            report_every,
        }
    }

    #[cfg(test)]
    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl Default for LogRenderSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl RenderSink for LogRenderSink {
    async fn configure(&mut self, header: VideoHeader) {
        info!(
            "LogRenderSink: {}x{} @ {:.2} fps",
            header.width, header.height, header.frame_rate
        );
    }

    async fn show(&mut self, frame: DisplayFrame) -> Result<(), SinkError> {
        self.shown += 1;
        self.window_frames += 1;
        debug!(
            "LogRenderSink: frame {} ({} bytes, {:?})",
            self.shown,
            frame.data.len(),
            frame.format
        );

        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.report_every {
            info!(
                "LogRenderSink: {} frames shown, {:.1} fps",
                self.shown,
                self.window_frames as f64 / elapsed.as_secs_f64()
            );
            self.window_frames = 0;
            self.window_start = Some(now);
        }
        Ok(())
    }

    async fn close(&mut self) {
        info!("LogRenderSink: closed after {} frames", self.shown);
    }
}
