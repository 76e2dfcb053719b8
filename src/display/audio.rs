//! Audio sinks

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

use super::AudioSink;
use crate::error::SinkError;
use crate::pipeline::types::AudioHeader;

/// Discards every chunk immediately
#[derive(Debug, Default)]
pub struct NullAudioSink;

#[async_trait]
impl AudioSink for NullAudioSink {
    async fn write(&mut self, _pcm: Bytes) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Counts written PCM and logs a total on close
#[derive(Debug, Default)]
pub struct LogAudioSink {
    chunks: u64,
    bytes: u64,
}

impl LogAudioSink {
    #[cfg(test)]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl AudioSink for LogAudioSink {
    async fn configure(&mut self, header: AudioHeader) {
        info!(
            "LogAudioSink: {} Hz, {} channels",
            header.sample_rate, header.channel_count
        );
    }

    async fn write(&mut self, pcm: Bytes) -> Result<(), SinkError> {
        self.chunks += 1;
        self.bytes += pcm.len() as u64;
        Ok(())
    }

    async fn close(&mut self) {
        info!(
            "LogAudioSink: closed after {} chunks ({} bytes)",
            self.chunks, self.bytes
        );
    }
}

/// Gives a non-blocking sink the timing behaviour of a sound device
///
/// A device accepts a write only once its queue has room, so a producer that
/// writes as fast as possible is throttled to real time. This wrapper keeps a
/// virtual play head and suspends a write while more than `device_buffer` of
/// audio is queued ahead of the wall clock.
pub struct PacedAudioSink<S> {
    inner: S,
    header: Option<AudioHeader>,
    play_head: Option<Instant>,
    device_buffer: Duration,
}

impl<S: AudioSink> PacedAudioSink<S> {
    pub fn new(inner: S, device_buffer: Duration) -> Self {
        Self {
            inner,
            header: None,
            play_head: None,
            device_buffer,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: AudioSink> AudioSink for PacedAudioSink<S> {
    async fn configure(&mut self, header: AudioHeader) {
        self.header = Some(header);
        self.inner.configure(header).await;
    }

    async fn write(&mut self, pcm: Bytes) -> Result<(), SinkError> {
        let Some(header) = self.header else {
            return Err(SinkError::audio("write before the stream format is known"));
        };

        let now = Instant::now();
        let start = self.play_head.filter(|head| *head > now).unwrap_or(now);
        let head = start + header.duration_of(pcm.len());
        self.play_head = Some(head);

        self.inner.write(pcm).await?;

        if head > now + self.device_buffer {
            sleep_until(head - self.device_buffer).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paced_sink_throttles_to_real_time() {
        let header = AudioHeader {
            sample_rate: 1000,
            channel_count: 1,
        };
        let mut sink = PacedAudioSink::new(LogAudioSink::default(), Duration::from_millis(100));
        sink.configure(header).await;

        let start = Instant::now();
        // 10 chunks of 100ms each (1000 Hz mono s16 = 2000 B/s)
        for _ in 0..10 {
            sink.write(Bytes::from(vec![0u8; 200])).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1000), "{elapsed:?}");
        assert_eq!(sink.into_inner().bytes(), 2000);
    }

    #[tokio::test]
    async fn test_paced_sink_requires_format() {
        let mut sink = PacedAudioSink::new(NullAudioSink, Duration::from_millis(50));
        assert!(sink.write(Bytes::from_static(&[0, 0])).await.is_err());
    }
}
