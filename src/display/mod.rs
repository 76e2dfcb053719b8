//! Output collaborators for the playback scheduler
//!
//! The core never renders or plays anything itself. It hands decoded frames
//! to a [`RenderSink`] and PCM chunks to an [`AudioSink`], and turns raw video
//! payloads into displayable frames through a [`FrameDecoder`].

pub mod audio;
pub mod video;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DecodeError, SinkError};
use crate::pipeline::types::{AudioHeader, VideoHeader};

pub use audio::{LogAudioSink, NullAudioSink, PacedAudioSink};
pub use video::{EncodedFrameDecoder, LogRenderSink, NullRenderSink, RgbFrameDecoder};

/// Pixel layout of a [`DisplayFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, row-major, no padding
    Rgb24,
    /// Still-encoded image (e.g. JPEG) left for the renderer to decode
    Encoded,
}

/// Frame ready to be shown by a render sink
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Turns a received video payload into a displayable frame
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, raw: Bytes, width: u32, height: u32) -> Result<DisplayFrame, DecodeError>;
}

/// Video output (window, texture upload, file...)
#[async_trait]
pub trait RenderSink: Send {
    /// Called once with the stream geometry before the first frame
    async fn configure(&mut self, _header: VideoHeader) {}

    async fn show(&mut self, frame: DisplayFrame) -> Result<(), SinkError>;

    /// Polled by the scheduler; `true` is handled like a STOP command
    fn quit_requested(&self) -> bool {
        false
    }

    async fn close(&mut self) {}
}

/// Audio output. Implementations pace themselves at the device rate.
#[async_trait]
pub trait AudioSink: Send {
    /// Called once with the stream format before the first chunk
    async fn configure(&mut self, _header: AudioHeader) {}

    async fn write(&mut self, pcm: Bytes) -> Result<(), SinkError>;

    async fn close(&mut self) {}
}

#[async_trait]
impl<T: RenderSink + ?Sized> RenderSink for Box<T> {
    async fn configure(&mut self, header: VideoHeader) {
        (**self).configure(header).await
    }

    async fn show(&mut self, frame: DisplayFrame) -> Result<(), SinkError> {
        (**self).show(frame).await
    }

    fn quit_requested(&self) -> bool {
        (**self).quit_requested()
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: AudioSink + ?Sized> AudioSink for Box<T> {
    async fn configure(&mut self, header: AudioHeader) {
        (**self).configure(header).await
    }

    async fn write(&mut self, pcm: Bytes) -> Result<(), SinkError> {
        (**self).write(pcm).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
