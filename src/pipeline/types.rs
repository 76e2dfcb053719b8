//! Core types for the pipeline system

use bytes::Bytes;
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::Instant;

use crate::display::DisplayFrame;
use crate::error::StreamError;

/// Size in bytes of the video stream header
pub const VIDEO_HEADER_LEN: usize = 12;
/// Size in bytes of the audio stream header
pub const AUDIO_HEADER_LEN: usize = 8;
/// Raw video is 8-bit RGB
pub const RGB_BYTES_PER_PIXEL: usize = 3;
/// Raw audio is signed 16-bit PCM
pub const PCM_BYTES_PER_SAMPLE: usize = 2;
/// Upper bound on the channel count a header may declare
pub const MAX_CHANNELS: u32 = 32;

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Wire format spoken by the media connections
///
/// The transport also fixes the key variant of every unit and therefore the
/// matching policy used by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Fixed-size raw frames, receive-order sequential keys
    Raw,
    /// Length-prefixed `"<timestamp>|<payload>"` frames, sender timestamps
    Timestamped,
}

impl Transport {
    pub fn key_kind(&self) -> KeyKind {
        match self {
            Transport::Raw => KeyKind::Sequential,
            Transport::Timestamped => KeyKind::Timestamp,
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Transport::Raw),
            "timestamped" => Ok(Transport::Timestamped),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Raw => write!(f, "raw"),
            Transport::Timestamped => write!(f, "timestamped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Sequential,
    Timestamp,
}

/// Ordering and timing identifier of a media unit
///
/// Timestamp keys are always finite; receivers reject anything else before a
/// key is built, which keeps the total order below sound.
#[derive(Debug, Clone, Copy)]
pub enum PresentationKey {
    /// Zero-based receive-order index
    Sequential(u64),
    /// Sender wall-clock time in seconds
    Timestamp(f64),
}

impl PresentationKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            PresentationKey::Sequential(_) => KeyKind::Sequential,
            PresentationKey::Timestamp(_) => KeyKind::Timestamp,
        }
    }

    /// Presentation time of this key in seconds.
    ///
    /// Sequential keys need the stream's unit rate; `None` until it is known.
    pub fn seconds(&self, units_per_second: Option<f64>) -> Option<f64> {
        match *self {
            PresentationKey::Sequential(index) => {
                units_per_second.filter(|r| *r > 0.0).map(|r| index as f64 / r)
            }
            PresentationKey::Timestamp(ts) => Some(ts),
        }
    }
}

impl PartialEq for PresentationKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PresentationKey {}

impl PartialOrd for PresentationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PresentationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use PresentationKey::*;
        match (self, other) {
            (Sequential(a), Sequential(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.total_cmp(b),
            (Sequential(_), Timestamp(_)) => Ordering::Less,
            (Timestamp(_), Sequential(_)) => Ordering::Greater,
        }
    }
}

impl std::fmt::Display for PresentationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresentationKey::Sequential(index) => write!(f, "#{index}"),
            PresentationKey::Timestamp(ts) => write!(f, "{ts:.3}s"),
        }
    }
}

/// Geometry and rate of a video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoHeader {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
}

impl VideoHeader {
    /// Decode the 12-byte header (`u32 width, u32 height, f32 fps`, native order)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() != VIDEO_HEADER_LEN {
            return Err(StreamError::protocol(format!(
                "video header must be {VIDEO_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            width: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            height: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            frame_rate: f32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; VIDEO_HEADER_LEN] {
        let mut out = [0u8; VIDEO_HEADER_LEN];
        out[0..4].copy_from_slice(&self.width.to_ne_bytes());
        out[4..8].copy_from_slice(&self.height.to_ne_bytes());
        out[8..12].copy_from_slice(&self.frame_rate.to_ne_bytes());
        out
    }

    /// Size of one raw RGB frame, `None` on overflow
    pub fn frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(RGB_BYTES_PER_PIXEL)
    }

    pub fn validate(&self, max_frame_len: usize) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::protocol(format!(
                "video geometry {}x{} is empty",
                self.width, self.height
            )));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(StreamError::protocol(format!(
                "video frame rate {} is not a positive number",
                self.frame_rate
            )));
        }
        match self.frame_len() {
            Some(len) if len <= max_frame_len => Ok(()),
            _ => Err(StreamError::protocol(format!(
                "raw {}x{} frames exceed the {max_frame_len} byte frame limit",
                self.width, self.height
            ))),
        }
    }
}

/// Sample format of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub sample_rate: u32,
    pub channel_count: u32,
}

impl AudioHeader {
    /// Decode the 8-byte header (`u32 sample_rate, u32 channels`, native order)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() != AUDIO_HEADER_LEN {
            return Err(StreamError::protocol(format!(
                "audio header must be {AUDIO_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            sample_rate: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            channel_count: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; AUDIO_HEADER_LEN] {
        let mut out = [0u8; AUDIO_HEADER_LEN];
        out[0..4].copy_from_slice(&self.sample_rate.to_ne_bytes());
        out[4..8].copy_from_slice(&self.channel_count.to_ne_bytes());
        out
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.sample_rate == 0 {
            return Err(StreamError::protocol("audio sample rate is zero"));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(StreamError::protocol(format!(
                "audio channel count {} outside 1..={MAX_CHANNELS}",
                self.channel_count
            )));
        }
        Ok(())
    }

    /// PCM byte rate of the stream
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channel_count as u64 * PCM_BYTES_PER_SAMPLE as u64
    }

    /// Playback duration of `len` bytes of PCM
    pub fn duration_of(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 / self.bytes_per_second() as f64)
    }
}

/// Per-connection stream metadata, received once before any unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamHeader {
    Video(VideoHeader),
    Audio(AudioHeader),
}

impl StreamHeader {
    pub fn kind(&self) -> MediaKind {
        match self {
            StreamHeader::Video(_) => MediaKind::Video,
            StreamHeader::Audio(_) => MediaKind::Audio,
        }
    }
}

/// Decoded payload of a media unit
#[derive(Debug, Clone)]
pub enum Payload {
    Video(DisplayFrame),
    Audio(Bytes),
}

impl Payload {
    pub fn size(&self) -> usize {
        match self {
            Payload::Video(frame) => frame.data.len(),
            Payload::Audio(pcm) => pcm.len(),
        }
    }
}

/// One decoded chunk of video or audio and its presentation key
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub key: PresentationKey,
    pub payload: Payload,
    pub received_at: Instant,
}

impl MediaUnit {
    pub fn video(key: PresentationKey, frame: DisplayFrame) -> Self {
        Self {
            key,
            payload: Payload::Video(frame),
            received_at: Instant::now(),
        }
    }

    pub fn audio(key: PresentationKey, pcm: Bytes) -> Self {
        Self {
            key,
            payload: Payload::Audio(pcm),
            received_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self.payload {
            Payload::Video(_) => MediaKind::Video,
            Payload::Audio(_) => MediaKind::Audio,
        }
    }

    /// Get the size of the unit payload in bytes
    pub fn size(&self) -> usize {
        self.payload.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            PresentationKey::Timestamp(1.2),
            PresentationKey::Timestamp(1.0),
            PresentationKey::Timestamp(1.05),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PresentationKey::Timestamp(1.0),
                PresentationKey::Timestamp(1.05),
                PresentationKey::Timestamp(1.2),
            ]
        );
        assert!(PresentationKey::Sequential(3) < PresentationKey::Sequential(10));
    }

    #[test]
    fn test_key_seconds() {
        assert_eq!(PresentationKey::Sequential(50).seconds(Some(25.0)), Some(2.0));
        assert_eq!(PresentationKey::Sequential(50).seconds(None), None);
        assert_eq!(PresentationKey::Timestamp(3.5).seconds(None), Some(3.5));
    }

    #[test]
    fn test_video_header_roundtrip_and_validation() {
        let header = VideoHeader {
            width: 640,
            height: 360,
            frame_rate: 25.0,
        };
        let parsed = VideoHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.frame_len(), Some(640 * 360 * 3));
        assert!(parsed.validate(64 * 1024 * 1024).is_ok());

        // Frame larger than the configured limit
        assert!(parsed.validate(1024).is_err());

        let bad_rate = VideoHeader {
            frame_rate: f32::NAN,
            ..header
        };
        assert!(bad_rate.validate(usize::MAX).is_err());

        let empty = VideoHeader { width: 0, ..header };
        assert!(empty.validate(usize::MAX).is_err());
    }

    #[test]
    fn test_audio_header_validation() {
        let header = AudioHeader {
            sample_rate: 44_100,
            channel_count: 2,
        };
        assert_eq!(AudioHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        assert!(header.validate().is_ok());
        assert_eq!(header.bytes_per_second(), 176_400);

        assert!(AudioHeader { sample_rate: 0, ..header }.validate().is_err());
        assert!(AudioHeader { channel_count: 64, ..header }.validate().is_err());
        assert!(AudioHeader::from_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("RAW".parse::<Transport>().unwrap(), Transport::Raw);
        assert_eq!(
            "timestamped".parse::<Transport>().unwrap().key_kind(),
            KeyKind::Timestamp
        );
        assert!("rtp".parse::<Transport>().is_err());
    }
}
