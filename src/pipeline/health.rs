//! Health monitoring and metrics for a playback session

use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::MediaKind;

/// Per-stream counters
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Units decoded and accepted into the buffer
    pub received: AtomicU64,
    /// Units handed to a sink
    pub emitted: AtomicU64,
    /// Units dropped by the timestamp matcher
    pub unmatched: AtomicU64,
    /// Units evicted for exceeding the staleness horizon
    pub evicted: AtomicU64,
    /// Units refused by the buffer (late or duplicate keys)
    pub rejected: AtomicU64,
    /// Frames skipped for framing or decode problems
    pub framing_errors: AtomicU64,
    /// Sink write/show failures
    pub sink_errors: AtomicU64,
    /// Payload bytes received
    pub bytes: AtomicU64,
}

/// Health metrics for a session
///
/// All counters are atomics so receivers and the scheduler update them
/// without coordination.
pub struct SessionHealth {
    video: StreamCounters,
    audio: StreamCounters,
    started: Instant,
    /// Microseconds after `started` of the last received unit
    last_receive: AtomicU64,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self {
            video: StreamCounters::default(),
            audio: StreamCounters::default(),
            started: Instant::now(),
            last_receive: AtomicU64::new(0),
        }
    }

    pub fn stream(&self, kind: MediaKind) -> &StreamCounters {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Record a unit accepted into the buffer
    pub fn record_received(&self, kind: MediaKind, size: usize) {
        let counters = self.stream(kind);
        counters.received.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.last_receive.store(
            self.started.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn record_emitted(&self, kind: MediaKind) {
        self.stream(kind).emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self, kind: MediaKind) {
        self.stream(kind).unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, kind: MediaKind, count: usize) {
        self.stream(kind)
            .evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, kind: MediaKind) {
        self.stream(kind).rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_framing_error(&self, kind: MediaKind) {
        self.stream(kind)
            .framing_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self, kind: MediaKind) {
        self.stream(kind).sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last unit was received (or since creation)
    pub fn since_last_receive(&self) -> Duration {
        let last = Duration::from_micros(self.last_receive.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Check if the session has stalled (no units for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.since_last_receive() > threshold
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            video: StreamSummary::from(&self.video),
            audio: StreamSummary::from(&self.audio),
            uptime: self.started.elapsed(),
        }
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one stream's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub received: u64,
    pub emitted: u64,
    pub unmatched: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub framing_errors: u64,
    pub sink_errors: u64,
    pub bytes: u64,
}

impl From<&StreamCounters> for StreamSummary {
    fn from(c: &StreamCounters) -> Self {
        Self {
            received: c.received.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            framing_errors: c.framing_errors.load(Ordering::Relaxed),
            sink_errors: c.sink_errors.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
        }
    }
}

impl StreamSummary {
    /// Units that left the buffer without being played
    pub fn dropped(&self) -> u64 {
        self.unmatched + self.evicted
    }
}

/// Snapshot of session health
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub video: StreamSummary,
    pub audio: StreamSummary,
    pub uptime: Duration,
}

impl HealthSummary {
    pub fn stream(&self, kind: MediaKind) -> &StreamSummary {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Health after {:.1}s:", self.uptime.as_secs_f64())?;
        for kind in MediaKind::ALL {
            let s = self.stream(kind);
            write!(
                f,
                " [{}: {} received, {} emitted, {} dropped, {} rejected, {} framing errors, {} sink errors, {} bytes]",
                kind,
                s.received,
                s.emitted,
                s.dropped(),
                s.rejected,
                s.framing_errors,
                s.sink_errors,
                s.bytes
            )?;
        }
        Ok(())
    }
}

/// Periodically logs session health until cancelled
pub struct HealthMonitor {
    health: Arc<SessionHealth>,
    log_interval: Duration,
    stall_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(health: Arc<SessionHealth>) -> Self {
        Self {
            health,
            log_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(5),
        }
    }

    /// Configure the log interval
    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.log_interval);
        interval.tick().await;
        let mut stalled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            info!("Session {}", self.health.summary());

            let now_stalled = self.health.is_stalled(self.stall_threshold);
            if now_stalled && !stalled {
                warn!(
                    "HealthMonitor: no media received for {:?}",
                    self.health.since_last_receive()
                );
            }
            stalled = now_stalled;
        }
    }
}
