//! Recording sinks and unit builders for pipeline tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

use crate::display::{AudioSink, DisplayFrame, PixelFormat, RenderSink};
use crate::error::SinkError;
use crate::pipeline::types::{AudioHeader, MediaUnit, PresentationKey, VideoHeader};

/// Payload carrying its own index in the first eight bytes
pub fn indexed_payload(index: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len.max(8)];
    data[..8].copy_from_slice(&index.to_be_bytes());
    Bytes::from(data)
}

fn payload_index(data: &[u8]) -> u64 {
    data.get(..8)
        .and_then(|head| head.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(u64::MAX)
}

/// 2x2 RGB frame tagged with `index`
pub fn video_unit(key: PresentationKey, index: u64) -> MediaUnit {
    MediaUnit::video(
        key,
        DisplayFrame {
            data: indexed_payload(index, 12),
            width: 2,
            height: 2,
            format: PixelFormat::Rgb24,
        },
    )
}

pub fn audio_unit(key: PresentationKey, index: u64) -> MediaUnit {
    MediaUnit::audio(key, indexed_payload(index, 8))
}

#[derive(Default)]
struct RenderLog {
    shown: Vec<(Instant, u64)>,
    header: Option<VideoHeader>,
    closed: bool,
}

/// Render sink recording when each frame was shown
#[derive(Clone, Default)]
pub struct RecordingRenderSink {
    log: Arc<Mutex<RenderLog>>,
    quit: Arc<AtomicBool>,
}

impl RecordingRenderSink {
    /// `(shown_at, index)` for every frame, in order
    pub fn emissions(&self) -> Vec<(Instant, u64)> {
        self.log.lock().shown.clone()
    }

    pub fn header(&self) -> Option<VideoHeader> {
        self.log.lock().header
    }

    pub fn closed(&self) -> bool {
        self.log.lock().closed
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl RenderSink for RecordingRenderSink {
    async fn configure(&mut self, header: VideoHeader) {
        self.log.lock().header = Some(header);
    }

    async fn show(&mut self, frame: DisplayFrame) -> Result<(), SinkError> {
        self.log
            .lock()
            .shown
            .push((Instant::now(), payload_index(&frame.data)));
        Ok(())
    }

    fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }

    async fn close(&mut self) {
        self.log.lock().closed = true;
    }
}

#[derive(Default)]
struct AudioLog {
    written: Vec<(Instant, u64)>,
    header: Option<AudioHeader>,
    fail: bool,
}

/// Audio sink recording every written chunk
#[derive(Clone, Default)]
pub struct RecordingAudioSink {
    log: Arc<Mutex<AudioLog>>,
}

impl RecordingAudioSink {
    /// Indices of the written chunks, in order
    pub fn chunks(&self) -> Vec<u64> {
        self.log.lock().written.iter().map(|(_, i)| *i).collect()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.log.lock().written.iter().map(|(at, _)| *at).collect()
    }

    pub fn configured(&self) -> bool {
        self.log.lock().header.is_some()
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.log.lock().fail = fail;
    }
}

#[async_trait]
impl AudioSink for RecordingAudioSink {
    async fn configure(&mut self, header: AudioHeader) {
        self.log.lock().header = Some(header);
    }

    async fn write(&mut self, pcm: Bytes) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        if log.fail {
            return Err(SinkError::audio("device unavailable"));
        }
        log.written.push((Instant::now(), payload_index(&pcm)));
        Ok(())
    }
}
