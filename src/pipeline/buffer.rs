//! Synchronization buffer shared by the stream receivers and the scheduler
//!
//! One ordered map per stream, each behind its own lock so video and audio
//! insertions never contend. Receivers insert, the scheduler is the single
//! remover. A key leaves a map exactly once, either consumed or evicted.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Notify;

use super::types::{KeyKind, MediaKind, MediaUnit, PresentationKey, StreamHeader};
use crate::error::BufferError;

/// Outcome of a successful insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// Oldest units dropped to keep the buffered span within the horizon
    pub evicted: usize,
}

/// Next action for the timestamp matcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchStep {
    /// Both minimum keys are within tolerance; take and emit them together
    Pair {
        video: PresentationKey,
        audio: PresentationKey,
    },
    /// The older minimum was removed without a partner
    Dropped(MediaKind, PresentationKey),
    /// The other stream has ended; emit this unit alone
    Solo(MediaKind, PresentationKey),
    /// Waiting on more data
    Pending,
    /// Both streams ended and nothing is left
    Exhausted,
}

#[derive(Default)]
struct Lane {
    units: BTreeMap<PresentationKey, MediaUnit>,
    header: Option<StreamHeader>,
    /// Units per second, used to turn sequential keys into seconds
    rate: Option<f64>,
    closed: bool,
    last_removed: Option<PresentationKey>,
    /// Newest key time dropped by span eviction since last checked
    overrun: Option<f64>,
}

impl Lane {
    fn seconds(&self, key: &PresentationKey) -> Option<f64> {
        key.seconds(self.rate)
    }

    fn pop_first(&mut self) -> Option<MediaUnit> {
        let (key, unit) = self.units.pop_first()?;
        self.last_removed = Some(key);
        Some(unit)
    }

    fn min_seconds(&self) -> Option<(PresentationKey, f64)> {
        let key = *self.units.keys().next()?;
        self.seconds(&key).map(|secs| (key, secs))
    }

    /// Pop oldest units while the buffered span exceeds `horizon`
    fn enforce_span(&mut self, horizon: f64) -> usize {
        let mut evicted = 0;
        loop {
            let newest = match self.units.keys().next_back() {
                Some(key) => self.seconds(key),
                None => None,
            };
            let (Some(newest), Some((_, oldest))) = (newest, self.min_seconds()) else {
                break;
            };
            if newest - oldest <= horizon {
                break;
            }
            self.pop_first();
            self.overrun = Some(self.overrun.map_or(oldest, |o| o.max(oldest)));
            evicted += 1;
        }
        evicted
    }

    fn is_drained(&self) -> bool {
        self.closed && self.units.is_empty()
    }
}

struct LaneSlot {
    lane: Mutex<Lane>,
    notify: Notify,
}

impl LaneSlot {
    fn new() -> Self {
        Self {
            lane: Mutex::new(Lane::default()),
            notify: Notify::new(),
        }
    }
}

/// Per-stream ordered store of unplayed media units
pub struct SyncBuffer {
    video: LaneSlot,
    audio: LaneSlot,
    key_kind: KeyKind,
    horizon: Duration,
}

impl SyncBuffer {
    pub fn new(key_kind: KeyKind, horizon: Duration) -> Self {
        Self {
            video: LaneSlot::new(),
            audio: LaneSlot::new(),
            key_kind,
            horizon,
        }
    }

    fn slot(&self, kind: MediaKind) -> &LaneSlot {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Record a stream's header and its unit rate
    pub fn set_header(&self, header: StreamHeader, units_per_second: Option<f64>) {
        let mut lane = self.slot(header.kind()).lane.lock();
        lane.header = Some(header);
        lane.rate = units_per_second.filter(|r| r.is_finite() && *r > 0.0);
    }

    pub fn header(&self, kind: MediaKind) -> Option<StreamHeader> {
        self.slot(kind).lane.lock().header
    }

    #[cfg(test)]
    pub fn rate(&self, kind: MediaKind) -> Option<f64> {
        self.slot(kind).lane.lock().rate
    }

    /// Presentation time of a key on the given stream
    pub fn key_seconds(&self, kind: MediaKind, key: &PresentationKey) -> Option<f64> {
        self.slot(kind).lane.lock().seconds(key)
    }

    /// Insert a unit, rejecting keys that would break per-stream ordering
    pub fn insert(&self, unit: MediaUnit) -> Result<Inserted, BufferError> {
        let kind = unit.kind();
        let key = unit.key;
        let slot = self.slot(kind);

        let evicted = {
            let mut lane = slot.lane.lock();
            if key.kind() != self.key_kind {
                return Err(BufferError::KeyKindMismatch { kind });
            }
            if lane.closed {
                return Err(BufferError::Closed { kind });
            }
            if lane.last_removed.is_some_and(|last| key <= last) {
                return Err(BufferError::Late {
                    kind,
                    key: key.to_string(),
                });
            }
            if lane.units.contains_key(&key) {
                return Err(BufferError::Duplicate {
                    kind,
                    key: key.to_string(),
                });
            }
            lane.units.insert(key, unit);
            lane.enforce_span(self.horizon.as_secs_f64())
        };

        slot.notify.notify_one();
        Ok(Inserted { evicted })
    }

    pub fn peek_min(&self, kind: MediaKind) -> Option<PresentationKey> {
        self.slot(kind).lane.lock().units.keys().next().copied()
    }

    pub fn pop_min(&self, kind: MediaKind) -> Option<MediaUnit> {
        self.slot(kind).lane.lock().pop_first()
    }

    /// Remove the unit with exactly this key, along with anything older
    ///
    /// Older units can only be present if they arrived after the caller
    /// looked. They are discarded and counted in the returned total.
    pub fn take(&self, kind: MediaKind, key: PresentationKey) -> Option<(MediaUnit, usize)> {
        let mut lane = self.slot(kind).lane.lock();
        let unit = lane.units.remove(&key)?;
        let before = lane.units.len();
        lane.units.retain(|k, _| *k > key);
        let skipped = before - lane.units.len();
        if lane.last_removed.is_none_or(|last| last < key) {
            lane.last_removed = Some(key);
        }
        Some((unit, skipped))
    }

    /// Drop every unit whose key time is before `cutoff` seconds
    pub fn evict_older_than(&self, kind: MediaKind, cutoff: f64) -> usize {
        let mut lane = self.slot(kind).lane.lock();
        let mut evicted = 0;
        while let Some((_, secs)) = lane.min_seconds() {
            if secs >= cutoff {
                break;
            }
            lane.pop_first();
            evicted += 1;
        }
        evicted
    }

    /// Mark a stream as ended; its remaining units can still be drained
    pub fn mark_closed(&self, kind: MediaKind) {
        let slot = self.slot(kind);
        slot.lane.lock().closed = true;
        slot.notify.notify_one();
    }

    pub fn is_closed(&self, kind: MediaKind) -> bool {
        self.slot(kind).lane.lock().closed
    }

    /// Closed with nothing left to play
    pub fn is_drained(&self, kind: MediaKind) -> bool {
        self.slot(kind).lane.lock().is_drained()
    }

    pub fn len(&self, kind: MediaKind) -> usize {
        self.slot(kind).lane.lock().units.len()
    }

    pub fn is_empty(&self, kind: MediaKind) -> bool {
        self.slot(kind).lane.lock().units.is_empty()
    }

    /// Resolve after the next insertion into, or closure of, this stream
    ///
    /// A wake-up issued while nobody was waiting is kept, so checking the
    /// buffer and then waiting cannot miss an insertion.
    pub async fn wait_for_data(&self, kind: MediaKind) {
        self.slot(kind).notify.notified().await
    }

    /// Resolve after activity on either stream
    pub async fn wait_for_any(&self) {
        tokio::select! {
            _ = self.video.notify.notified() => {}
            _ = self.audio.notify.notified() => {}
        }
    }

    /// Reconcile the minimum keys of both streams
    ///
    /// Drops are applied immediately. Pairs and solo units are left in place
    /// for the caller to [`take`](Self::take) once they are due.
    pub fn next_match(&self, tolerance: f64) -> MatchStep {
        let mut video = self.video.lane.lock();
        let mut audio = self.audio.lane.lock();

        match (video.min_seconds(), audio.min_seconds()) {
            (Some((vk, vs)), Some((ak, as_))) => {
                if (vs - as_).abs() <= tolerance {
                    MatchStep::Pair {
                        video: vk,
                        audio: ak,
                    }
                } else if vs < as_ {
                    video.pop_first();
                    MatchStep::Dropped(MediaKind::Video, vk)
                } else {
                    audio.pop_first();
                    MatchStep::Dropped(MediaKind::Audio, ak)
                }
            }
            (Some((vk, _)), None) if audio.is_drained() => MatchStep::Solo(MediaKind::Video, vk),
            (None, Some((ak, _))) if video.is_drained() => MatchStep::Solo(MediaKind::Audio, ak),
            _ if video.is_drained() && audio.is_drained() => MatchStep::Exhausted,
            _ => MatchStep::Pending,
        }
    }

    /// Key time of the oldest unit buffered on one stream
    pub fn oldest_seconds(&self, kind: MediaKind) -> Option<f64> {
        self.slot(kind).lane.lock().min_seconds().map(|(_, s)| s)
    }

    /// Newest key time span eviction dropped on this stream since the last call
    ///
    /// Span eviction only removes units that would otherwise still play, so a
    /// value at or past the playback position means the clock has fallen
    /// behind what the buffer can hold.
    pub fn take_overrun(&self, kind: MediaKind) -> Option<f64> {
        self.slot(kind).lane.lock().overrun.take()
    }

    /// Smallest key time buffered across both streams
    pub fn earliest_seconds(&self) -> Option<f64> {
        let video = self.video.lane.lock().min_seconds().map(|(_, s)| s);
        let audio = self.audio.lane.lock().min_seconds().map(|(_, s)| s);
        match (video, audio) {
            (Some(v), Some(a)) => Some(v.min(a)),
            (v, a) => v.or(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplayFrame, PixelFormat};
    use bytes::Bytes;

    fn frame() -> DisplayFrame {
        DisplayFrame {
            data: Bytes::from_static(&[1, 2, 3]),
            width: 1,
            height: 1,
            format: PixelFormat::Rgb24,
        }
    }

    fn video_at(ts: f64) -> MediaUnit {
        MediaUnit::video(PresentationKey::Timestamp(ts), frame())
    }

    fn audio_at(ts: f64) -> MediaUnit {
        MediaUnit::audio(PresentationKey::Timestamp(ts), Bytes::from_static(&[0, 0]))
    }

    fn timestamp_buffer() -> SyncBuffer {
        SyncBuffer::new(KeyKind::Timestamp, Duration::from_secs(10))
    }

    /// Drive the matcher the way the scheduler does, returning emitted pairs
    fn drain_pairs(buffer: &SyncBuffer) -> (Vec<(f64, f64)>, Vec<(MediaKind, f64)>) {
        let mut pairs = Vec::new();
        let mut dropped = Vec::new();
        loop {
            match buffer.next_match(0.1) {
                MatchStep::Pair { video, audio } => {
                    let (v, _) = buffer.take(MediaKind::Video, video).unwrap();
                    let (a, _) = buffer.take(MediaKind::Audio, audio).unwrap();
                    pairs.push((v.key.seconds(None).unwrap(), a.key.seconds(None).unwrap()));
                }
                MatchStep::Dropped(kind, key) => dropped.push((kind, key.seconds(None).unwrap())),
                _ => break,
            }
        }
        (pairs, dropped)
    }

    #[test]
    fn test_timestamp_matching() {
        let buffer = timestamp_buffer();
        for ts in [1.00, 1.05, 1.20] {
            buffer.insert(video_at(ts)).unwrap();
        }
        for ts in [1.02, 1.18] {
            buffer.insert(audio_at(ts)).unwrap();
        }

        let (pairs, dropped) = drain_pairs(&buffer);
        assert_eq!(pairs, vec![(1.00, 1.02), (1.20, 1.18)]);
        assert_eq!(dropped, vec![(MediaKind::Video, 1.05)]);
        assert!(buffer.is_empty(MediaKind::Video));
        assert!(buffer.is_empty(MediaKind::Audio));
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let buffer = timestamp_buffer();
        buffer.insert(video_at(2.0)).unwrap();
        buffer.insert(audio_at(2.0625)).unwrap();
        assert!(matches!(buffer.next_match(0.0625), MatchStep::Pair { .. }));
    }

    #[test]
    fn test_pending_until_partner_or_close() {
        let buffer = timestamp_buffer();
        buffer.insert(video_at(1.0)).unwrap();
        assert_eq!(buffer.next_match(0.1), MatchStep::Pending);

        buffer.mark_closed(MediaKind::Audio);
        assert_eq!(
            buffer.next_match(0.1),
            MatchStep::Solo(MediaKind::Video, PresentationKey::Timestamp(1.0))
        );

        buffer.take(MediaKind::Video, PresentationKey::Timestamp(1.0)).unwrap();
        assert_eq!(buffer.next_match(0.1), MatchStep::Pending);
        buffer.mark_closed(MediaKind::Video);
        assert_eq!(buffer.next_match(0.1), MatchStep::Exhausted);
    }

    #[test]
    fn test_rejects_late_and_duplicate_keys() {
        let buffer = timestamp_buffer();
        buffer.insert(video_at(1.0)).unwrap();
        assert!(matches!(
            buffer.insert(video_at(1.0)),
            Err(BufferError::Duplicate { .. })
        ));

        buffer.pop_min(MediaKind::Video).unwrap();
        assert!(matches!(
            buffer.insert(video_at(0.5)),
            Err(BufferError::Late { .. })
        ));
        assert!(matches!(
            buffer.insert(video_at(1.0)),
            Err(BufferError::Late { .. })
        ));
        buffer.insert(video_at(1.5)).unwrap();

        assert!(matches!(
            buffer.insert(MediaUnit::video(PresentationKey::Sequential(3), frame())),
            Err(BufferError::KeyKindMismatch { .. })
        ));

        buffer.mark_closed(MediaKind::Video);
        assert!(matches!(
            buffer.insert(video_at(2.0)),
            Err(BufferError::Closed { .. })
        ));
    }

    #[test]
    fn test_span_eviction_on_insert() {
        let buffer = SyncBuffer::new(KeyKind::Sequential, Duration::from_secs(1));
        buffer.set_header(
            StreamHeader::Video(crate::pipeline::types::VideoHeader {
                width: 1,
                height: 1,
                frame_rate: 4.0,
            }),
            Some(4.0),
        );

        let mut evicted = 0;
        for index in 0..10 {
            let unit = MediaUnit::video(PresentationKey::Sequential(index), frame());
            evicted += buffer.insert(unit).unwrap().evicted;
        }
        // Keys 5..=9 span exactly one second
        assert_eq!(evicted, 5);
        assert_eq!(buffer.peek_min(MediaKind::Video), Some(PresentationKey::Sequential(5)));
        assert_eq!(buffer.oldest_seconds(MediaKind::Video), Some(1.25));
        assert!(matches!(
            buffer.insert(MediaUnit::video(PresentationKey::Sequential(2), frame())),
            Err(BufferError::Late { .. })
        ));

        // Newest evicted key is 4, reported once
        assert_eq!(buffer.take_overrun(MediaKind::Video), Some(1.0));
        assert_eq!(buffer.take_overrun(MediaKind::Video), None);
        assert_eq!(buffer.take_overrun(MediaKind::Audio), None);

        // Clock eviction is not an overrun
        buffer.evict_older_than(MediaKind::Video, 1.6);
        assert_eq!(buffer.take_overrun(MediaKind::Video), None);
    }

    #[test]
    fn test_clock_eviction() {
        let buffer = timestamp_buffer();
        for ts in [1.0, 2.0, 3.0, 4.0] {
            buffer.insert(audio_at(ts)).unwrap();
        }
        assert_eq!(buffer.evict_older_than(MediaKind::Audio, 2.5), 2);
        assert_eq!(buffer.peek_min(MediaKind::Audio), Some(PresentationKey::Timestamp(3.0)));
        assert_eq!(buffer.earliest_seconds(), Some(3.0));
    }

    #[test]
    fn test_take_discards_older_units() {
        let buffer = timestamp_buffer();
        for ts in [1.0, 2.0, 3.0] {
            buffer.insert(video_at(ts)).unwrap();
        }
        let (unit, skipped) = buffer
            .take(MediaKind::Video, PresentationKey::Timestamp(2.0))
            .unwrap();
        assert_eq!(unit.key, PresentationKey::Timestamp(2.0));
        assert_eq!(skipped, 1);
        assert_eq!(buffer.len(MediaKind::Video), 1);
        assert!(buffer.take(MediaKind::Video, PresentationKey::Timestamp(2.0)).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_data_keeps_early_wakeup() {
        let buffer = timestamp_buffer();
        buffer.insert(audio_at(1.0)).unwrap();
        // Insertion happened before anyone waited; the wake-up is not lost
        tokio::time::timeout(Duration::from_secs(1), buffer.wait_for_data(MediaKind::Audio))
            .await
            .unwrap();
    }
}
