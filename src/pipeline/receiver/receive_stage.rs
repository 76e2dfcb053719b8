//! Stream receive stage
//!
//! Owns one media connection: parses the stream header once, then decodes
//! units and inserts them into the synchronization buffer until the peer
//! closes or the session is cancelled.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::framing::{FramedReader, ReadOutcome, split_timestamped};
use crate::display::FrameDecoder;
use crate::error::StreamError;
use crate::pipeline::PipelineStage;
use crate::pipeline::buffer::SyncBuffer;
use crate::pipeline::health::SessionHealth;
use crate::pipeline::types::{
    AUDIO_HEADER_LEN, AudioHeader, MediaKind, MediaUnit, PresentationKey, StreamHeader,
    Transport, VIDEO_HEADER_LEN, VideoHeader,
};

/// Receiver settings shared by both streams
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    pub transport: Transport,
    /// Upper bound on a single frame, raw or length-prefixed
    pub max_frame_len: usize,
    /// Size of one raw PCM chunk
    pub audio_chunk_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Raw,
            max_frame_len: 64 * 1024 * 1024,
            audio_chunk_bytes: 4096,
        }
    }
}

/// Receiver lifecycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiverPhase {
    AwaitingHeader,
    Streaming(StreamHeader),
}

/// Receive stage for one stream
pub struct StreamReceiver<R> {
    kind: MediaKind,
    reader: FramedReader<R>,
    phase: ReceiverPhase,
    config: ReceiverConfig,
    decoder: Arc<dyn FrameDecoder>,
    buffer: Arc<SyncBuffer>,
    health: Arc<SessionHealth>,
    cancel: CancellationToken,
    next_index: u64,
    accepted: u64,
}

impl<R: AsyncRead + Unpin + Send> StreamReceiver<R> {
    pub fn new(
        kind: MediaKind,
        conn: R,
        config: ReceiverConfig,
        decoder: Arc<dyn FrameDecoder>,
        buffer: Arc<SyncBuffer>,
        health: Arc<SessionHealth>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kind,
            reader: FramedReader::new(conn),
            phase: ReceiverPhase::AwaitingHeader,
            config,
            decoder,
            buffer,
            health,
            cancel,
            next_index: 0,
            accepted: 0,
        }
    }

    pub fn phase(&self) -> ReceiverPhase {
        self.phase
    }

    /// Units accepted into the buffer so far
    #[cfg(test)]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Read, validate and publish the stream header
    pub async fn read_header(&mut self) -> Result<StreamHeader, StreamError> {
        if self.phase != ReceiverPhase::AwaitingHeader {
            return Err(StreamError::protocol(format!(
                "{} stream header received twice",
                self.kind
            )));
        }

        let header = match self.kind {
            MediaKind::Video => {
                let bytes = self.reader.read_header(VIDEO_HEADER_LEN).await?;
                let header = VideoHeader::from_bytes(&bytes)?;
                header.validate(self.config.max_frame_len)?;
                StreamHeader::Video(header)
            }
            MediaKind::Audio => {
                let bytes = self.reader.read_header(AUDIO_HEADER_LEN).await?;
                let header = AudioHeader::from_bytes(&bytes)?;
                header.validate()?;
                StreamHeader::Audio(header)
            }
        };

        self.buffer.set_header(header, self.units_per_second(&header));
        self.phase = ReceiverPhase::Streaming(header);
        info!("StreamReceiver: {} header {:?}", self.kind, header);
        Ok(header)
    }

    /// Unit rate used to turn sequential keys into presentation times
    fn units_per_second(&self, header: &StreamHeader) -> Option<f64> {
        match (self.config.transport, header) {
            (Transport::Timestamped, _) => None,
            (Transport::Raw, StreamHeader::Video(video)) => Some(video.frame_rate as f64),
            (Transport::Raw, StreamHeader::Audio(audio)) => {
                Some(audio.bytes_per_second() as f64 / self.config.audio_chunk_bytes as f64)
            }
        }
    }

    /// Read the next frame and assign its key
    ///
    /// `Ok(None)` means the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<(PresentationKey, Bytes)>, StreamError> {
        let ReceiverPhase::Streaming(header) = self.phase else {
            return Err(StreamError::protocol(format!(
                "{} data before stream header",
                self.kind
            )));
        };

        match self.config.transport {
            Transport::Raw => {
                let len = match header {
                    StreamHeader::Video(video) => video
                        .frame_len()
                        .ok_or_else(|| StreamError::protocol("raw frame size overflows"))?,
                    StreamHeader::Audio(_) => self.config.audio_chunk_bytes,
                };
                match self.reader.read_exact(len).await? {
                    ReadOutcome::Data(raw) => {
                        let key = PresentationKey::Sequential(self.next_index);
                        self.next_index += 1;
                        Ok(Some((key, raw)))
                    }
                    ReadOutcome::Closed { received } => {
                        if received > 0 {
                            debug!(
                                "StreamReceiver: {} discarded {} trailing bytes of a {} byte frame",
                                self.kind, received, len
                            );
                        }
                        Ok(None)
                    }
                }
            }
            Transport::Timestamped => {
                match self.reader.read_length_prefixed(self.config.max_frame_len).await? {
                    Some(frame) => {
                        let (timestamp, payload) = split_timestamped(frame)?;
                        Ok(Some((PresentationKey::Timestamp(timestamp), payload)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Decode a unit and insert it into the buffer
    pub fn accept_unit(&mut self, key: PresentationKey, raw: Bytes) -> Result<(), StreamError> {
        let ReceiverPhase::Streaming(header) = self.phase else {
            return Err(StreamError::protocol(format!(
                "{} unit {} offered before stream header",
                self.kind, key
            )));
        };

        let size = raw.len();
        let unit = match header {
            StreamHeader::Video(video) => {
                match self.decoder.decode(raw, video.width, video.height) {
                    Ok(frame) => MediaUnit::video(key, frame),
                    Err(e) => {
                        warn!("StreamReceiver: {} unit {} skipped: {}", self.kind, key, e);
                        self.health.record_framing_error(self.kind);
                        return Ok(());
                    }
                }
            }
            StreamHeader::Audio(_) => MediaUnit::audio(key, raw),
        };

        match self.buffer.insert(unit) {
            Ok(inserted) => {
                self.accepted += 1;
                if self.accepted == 1 {
                    info!("StreamReceiver: first {} unit received ({})", self.kind, key);
                }
                self.health.record_received(self.kind, size);
                if inserted.evicted > 0 {
                    self.health.record_evicted(self.kind, inserted.evicted);
                    debug!(
                        "StreamReceiver: {} evicted {} units beyond the staleness horizon",
                        self.kind, inserted.evicted
                    );
                }
            }
            Err(e) => {
                self.health.record_rejected(self.kind);
                debug!("StreamReceiver: {}", e);
            }
        }
        Ok(())
    }

    async fn receive_loop(&mut self) -> Result<(), StreamError> {
        match self.read_header().await {
            Ok(_) => {}
            Err(StreamError::ConnectionClosed) => {
                warn!("StreamReceiver: {} connection closed before header", self.kind);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        loop {
            match self.next_frame().await {
                Ok(Some((key, raw))) => self.accept_unit(key, raw)?,
                Ok(None) | Err(StreamError::ConnectionClosed) => break,
                Err(e) if e.is_recoverable() => {
                    warn!("StreamReceiver: {} frame skipped: {}", self.kind, e);
                    self.health.record_framing_error(self.kind);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "StreamReceiver: {} stream ended ({} units, {} bytes)",
            self.kind,
            self.accepted,
            self.reader.bytes_read()
        );
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PipelineStage for StreamReceiver<R> {
    async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("StreamReceiver: {} cancelled", self.kind);
                Ok(())
            }
            result = self.receive_loop() => result,
        };

        // Lets the scheduler see end of stream once the lane drains
        self.buffer.mark_closed(self.kind);
        result.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        match self.kind {
            MediaKind::Video => "VideoReceiver",
            MediaKind::Audio => "AudioReceiver",
        }
    }
}
