//! Playback scheduler
//!
//! Sole owner of the presentation clock. Waits for the warm-up period,
//! establishes the epoch, then pulls units from the synchronization buffer
//! and emits each one to its sink when it is due.
//!
//! Two policies, chosen by the key kind of the buffer:
//!
//! - **Sequential**: video frame `k` is due at `epoch + k / frame_rate`;
//!   audio is drained in key order and the sink paces itself. Both lanes
//!   run concurrently.
//! - **Timestamp**: the minimum keys of both streams are reconciled. A pair
//!   within tolerance is emitted together, otherwise the older unit is
//!   dropped.
//!
//! Every wait is preemptible: a deadline, a state transition, new data and
//! session cancellation all wake the scheduler.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::display::{AudioSink, RenderSink};
use crate::pipeline::PipelineStage;
use crate::pipeline::buffer::{MatchStep, SyncBuffer};
use crate::pipeline::clock::PresentationClock;
use crate::pipeline::health::SessionHealth;
use crate::pipeline::state::{PlaybackControl, PlaybackState, StopReason};
use crate::pipeline::types::{
    KeyKind, MediaKind, MediaUnit, Payload, PresentationKey, StreamHeader,
};

/// Scheduler settings
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Largest key distance for a matched audio/video pair, in seconds
    pub tolerance: f64,
    /// Buffering time before the clock starts, measured from session start
    pub warm_up: Duration,
    /// How often the render sink's quit flag is checked while idle
    pub quit_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            warm_up: Duration::from_millis(200),
            quit_poll_interval: Duration::from_millis(20),
        }
    }
}

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Due,
    StateChanged,
    Data,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum DataWait {
    Nothing,
    Stream(MediaKind),
    Any,
}

/// Per-lane handle on the shared session state
struct Pacer {
    buffer: Arc<SyncBuffer>,
    control: PlaybackControl,
    health: Arc<SessionHealth>,
    state_rx: watch::Receiver<PlaybackState>,
    cancel: CancellationToken,
    clock: PresentationClock,
    quit_poll: Duration,
}

impl Pacer {
    fn new(
        buffer: &Arc<SyncBuffer>,
        control: &PlaybackControl,
        health: &Arc<SessionHealth>,
        clock: PresentationClock,
        quit_poll: Duration,
    ) -> Self {
        Self {
            buffer: buffer.clone(),
            control: control.clone(),
            health: health.clone(),
            state_rx: control.subscribe(),
            cancel: control.cancellation(),
            clock,
            quit_poll,
        }
    }

    /// Latest state, marking it seen so only later transitions wake us
    fn state(&mut self) -> PlaybackState {
        self.state_rx.borrow_and_update().clone()
    }

    async fn wait(&mut self, deadline: Option<Instant>, data: DataWait) -> Wake {
        let buffer = self.buffer.clone();
        let data_ready = async move {
            match data {
                DataWait::Nothing => std::future::pending::<()>().await,
                DataWait::Stream(kind) => buffer.wait_for_data(kind).await,
                DataWait::Any => buffer.wait_for_any().await,
            }
        };
        let due = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Stopped,
            changed = self.state_rx.changed() => {
                if changed.is_ok() { Wake::StateChanged } else { Wake::Stopped }
            }
            _ = due => Wake::Due,
            _ = data_ready => Wake::Data,
        }
    }

    /// Like [`wait`](Self::wait), also checking the render sink's quit flag
    async fn wait_polling<V: RenderSink>(
        &mut self,
        render: &mut V,
        deadline: Option<Instant>,
        data: DataWait,
    ) -> Wake {
        loop {
            let poll_at = Instant::now() + self.quit_poll;
            let (until, polling) = match deadline {
                Some(at) if at <= poll_at => (at, false),
                _ => (poll_at, true),
            };
            match self.wait(Some(until), data).await {
                Wake::Due if polling => {
                    if self.check_quit(render) {
                        return Wake::Stopped;
                    }
                }
                wake => return wake,
            }
        }
    }

    fn check_quit<V: RenderSink>(&self, render: &V) -> bool {
        if render.quit_requested() {
            self.control.stop(StopReason::UserQuit);
            true
        } else {
            false
        }
    }

    /// Drop units that fell behind the clock by more than the horizon
    fn evict_stale(&self, state: &PlaybackState, kind: MediaKind) {
        let Some(cutoff) = self
            .clock
            .stale_cutoff(state, Instant::now(), self.buffer.horizon())
        else {
            return;
        };
        let evicted = self.buffer.evict_older_than(kind, cutoff);
        if evicted > 0 {
            self.health.record_evicted(kind, evicted);
            debug!("Scheduler: evicted {} stale {} units", evicted, kind);
        }
    }

    /// Jump the clock to the oldest buffered unit once span eviction has
    /// dropped units that were still ahead of it
    ///
    /// Without this the clock would trail the buffer forever after a pause
    /// longer than the horizon, since every unit it waits for is evicted
    /// before it comes due.
    fn catch_up(&self, state: &PlaybackState, kinds: &[MediaKind]) -> bool {
        let Some(overrun) = kinds
            .iter()
            .filter_map(|kind| self.buffer.take_overrun(*kind))
            .reduce(f64::max)
        else {
            return false;
        };
        let Some(position) = self.clock.position(state, Instant::now()) else {
            return false;
        };
        if overrun < position {
            return false;
        }
        let Some(oldest) = kinds
            .iter()
            .filter_map(|kind| self.buffer.oldest_seconds(*kind))
            .reduce(f64::min)
        else {
            return false;
        };

        let lead = oldest - position;
        if !lead.is_finite() || lead <= 0.0 {
            return false;
        }
        let skipped = self.control.skip_ahead(Duration::from_secs_f64(lead));
        if skipped {
            info!(
                "Scheduler: clock {:.3}s behind buffered data, resuming at {:.3}s",
                lead, oldest
            );
        }
        skipped
    }

    /// Wall-clock instant at which this key is due
    fn target(&self, state: &PlaybackState, kind: MediaKind, key: &PresentationKey) -> Option<Instant> {
        let secs = self.buffer.key_seconds(kind, key)?;
        self.clock.target(state, secs)
    }

    fn take(&self, kind: MediaKind, key: PresentationKey) -> Option<MediaUnit> {
        let (unit, skipped) = self.buffer.take(kind, key)?;
        for _ in 0..skipped {
            self.health.record_unmatched(kind);
        }
        Some(unit)
    }

    /// Stop the session once both streams are closed and drained
    fn finish_if_exhausted(&self) -> bool {
        let exhausted = MediaKind::ALL.iter().all(|kind| self.buffer.is_drained(*kind));
        if exhausted {
            self.control.stop(StopReason::EndOfStream);
        }
        exhausted
    }

    async fn emit_video<V: RenderSink>(&self, render: &mut V, unit: MediaUnit) {
        let key = unit.key;
        let Payload::Video(frame) = unit.payload else {
            return;
        };
        match render.show(frame).await {
            Ok(()) => self.health.record_emitted(MediaKind::Video),
            Err(e) => {
                warn!("Scheduler: video unit {} not shown: {}", key, e);
                self.health.record_sink_error(MediaKind::Video);
            }
        }
    }

    /// Write a chunk; a write suspended by the sink's pacing ends on stop
    async fn emit_audio<A: AudioSink>(&self, audio: &mut A, unit: MediaUnit) -> bool {
        let key = unit.key;
        let Payload::Audio(pcm) = unit.payload else {
            return true;
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            result = audio.write(pcm) => result,
        };
        match result {
            Ok(()) => self.health.record_emitted(MediaKind::Audio),
            Err(e) => {
                warn!("Scheduler: audio unit {} not written: {}", key, e);
                self.health.record_sink_error(MediaKind::Audio);
            }
        }
        true
    }
}

/// Playback scheduler stage
pub struct PlaybackScheduler<V, A> {
    buffer: Arc<SyncBuffer>,
    control: PlaybackControl,
    health: Arc<SessionHealth>,
    config: SchedulerConfig,
    render: V,
    audio: A,
    session_start: Instant,
    clock: PresentationClock,
}

impl<V: RenderSink, A: AudioSink> PlaybackScheduler<V, A> {
    pub fn new(
        buffer: Arc<SyncBuffer>,
        control: PlaybackControl,
        health: Arc<SessionHealth>,
        config: SchedulerConfig,
        render: V,
        audio: A,
    ) -> Self {
        Self {
            buffer,
            control,
            health,
            config,
            render,
            audio,
            session_start: Instant::now(),
            clock: PresentationClock::default(),
        }
    }

    fn pacer(&self) -> Pacer {
        Pacer::new(
            &self.buffer,
            &self.control,
            &self.health,
            self.clock,
            self.config.quit_poll_interval,
        )
    }

    /// Wait out the warm-up, then start the clock once every stream has
    /// data or has ended. Returns `false` if the session ended first.
    async fn await_start(&mut self) -> bool {
        let warm_until = self.session_start + self.config.warm_up;
        let mut pacer = self.pacer();

        loop {
            if pacer.state().stopped {
                return false;
            }

            let now = Instant::now();
            if now >= warm_until {
                let has_data = |kind: &MediaKind| !self.buffer.is_empty(*kind);
                let ready = MediaKind::ALL
                    .iter()
                    .all(|kind| has_data(kind) || self.buffer.is_closed(*kind));

                if ready && MediaKind::ALL.iter().any(has_data) {
                    self.start(now).await;
                    return true;
                }
                if pacer.finish_if_exhausted() {
                    info!("Scheduler: both streams ended before playback started");
                    return false;
                }
            }

            let deadline = (now < warm_until).then_some(warm_until);
            if pacer
                .wait_polling(&mut self.render, deadline, DataWait::Any)
                .await
                == Wake::Stopped
            {
                return false;
            }
        }
    }

    async fn start(&mut self, now: Instant) {
        let origin = match self.buffer.key_kind() {
            KeyKind::Sequential => 0.0,
            KeyKind::Timestamp => self.buffer.earliest_seconds().unwrap_or(0.0),
        };
        self.clock = PresentationClock::new(origin);

        if let Some(StreamHeader::Video(header)) = self.buffer.header(MediaKind::Video) {
            self.render.configure(header).await;
        }
        if let Some(StreamHeader::Audio(header)) = self.buffer.header(MediaKind::Audio) {
            self.audio.configure(header).await;
        }

        self.control.establish_epoch(now);
        info!(
            "Scheduler: playback started after {:?} (origin {:.3}s, {} video / {} audio buffered)",
            now.saturating_duration_since(self.session_start),
            origin,
            self.buffer.len(MediaKind::Video),
            self.buffer.len(MediaKind::Audio)
        );
    }

    /// Sequential policy: independent video and audio lanes
    async fn run_sequential(&mut self) {
        let video = self.pacer();
        let audio = self.pacer();
        tokio::join!(
            video_lane(video, &mut self.render),
            audio_lane(audio, &mut self.audio)
        );
    }

    /// Timestamp policy: reconcile the minimum keys of both streams
    async fn run_timestamp(&mut self) {
        let tolerance = self.config.tolerance;
        let mut pacer = self.pacer();

        loop {
            let state = pacer.state();
            if state.stopped {
                break;
            }
            if !state.can_emit() {
                if pacer
                    .wait_polling(&mut self.render, None, DataWait::Nothing)
                    .await
                    == Wake::Stopped
                {
                    break;
                }
                continue;
            }

            for kind in MediaKind::ALL {
                pacer.evict_stale(&state, kind);
            }
            if pacer.catch_up(&state, &MediaKind::ALL) {
                continue;
            }

            match self.buffer.next_match(tolerance) {
                MatchStep::Pair { video, audio } => {
                    let target = [
                        pacer.target(&state, MediaKind::Video, &video),
                        pacer.target(&state, MediaKind::Audio, &audio),
                    ]
                    .into_iter()
                    .flatten()
                    .min();
                    if let Some(at) = target
                        && Instant::now() < at
                    {
                        if pacer
                            .wait_polling(&mut self.render, Some(at), DataWait::Nothing)
                            .await
                            == Wake::Stopped
                        {
                            break;
                        }
                        continue;
                    }

                    if let Some(unit) = pacer.take(MediaKind::Video, video) {
                        pacer.emit_video(&mut self.render, unit).await;
                    }
                    if pacer.check_quit(&self.render) {
                        break;
                    }
                    if let Some(unit) = pacer.take(MediaKind::Audio, audio)
                        && !pacer.emit_audio(&mut self.audio, unit).await
                    {
                        break;
                    }
                }
                MatchStep::Dropped(kind, key) => {
                    pacer.health.record_unmatched(kind);
                    debug!("Scheduler: dropped unmatched {} unit {}", kind, key);
                }
                MatchStep::Solo(kind, key) => {
                    if let Some(at) = pacer.target(&state, kind, &key)
                        && Instant::now() < at
                    {
                        if pacer
                            .wait_polling(&mut self.render, Some(at), DataWait::Nothing)
                            .await
                            == Wake::Stopped
                        {
                            break;
                        }
                        continue;
                    }

                    let Some(unit) = pacer.take(kind, key) else {
                        continue;
                    };
                    match kind {
                        MediaKind::Video => {
                            pacer.emit_video(&mut self.render, unit).await;
                            if pacer.check_quit(&self.render) {
                                break;
                            }
                        }
                        MediaKind::Audio => {
                            if !pacer.emit_audio(&mut self.audio, unit).await {
                                break;
                            }
                        }
                    }
                }
                MatchStep::Pending => {
                    if pacer
                        .wait_polling(&mut self.render, None, DataWait::Any)
                        .await
                        == Wake::Stopped
                    {
                        break;
                    }
                }
                MatchStep::Exhausted => {
                    pacer.finish_if_exhausted();
                    break;
                }
            }
        }
    }
}

/// Emit video frames at `epoch + key / frame_rate`
async fn video_lane<V: RenderSink>(mut pacer: Pacer, render: &mut V) {
    let kind = MediaKind::Video;

    loop {
        let state = pacer.state();
        if state.stopped {
            return;
        }
        if !state.can_emit() {
            if pacer.wait_polling(render, None, DataWait::Nothing).await == Wake::Stopped {
                return;
            }
            continue;
        }

        pacer.evict_stale(&state, kind);
        if pacer.catch_up(&state, &[kind]) {
            continue;
        }

        let Some(key) = pacer.buffer.peek_min(kind) else {
            if pacer.buffer.is_drained(kind) {
                break;
            }
            if pacer.wait_polling(render, None, DataWait::Stream(kind)).await == Wake::Stopped {
                return;
            }
            continue;
        };

        if let Some(at) = pacer.target(&state, kind, &key)
            && Instant::now() < at
        {
            if pacer.wait_polling(render, Some(at), DataWait::Nothing).await == Wake::Stopped {
                return;
            }
            continue;
        }

        if let Some(unit) = pacer.take(kind, key) {
            pacer.emit_video(render, unit).await;
        }
        if pacer.check_quit(render) {
            return;
        }
    }

    info!("Scheduler: video stream finished");
    // Keep honouring quit requests until the audio lane is done too
    while !pacer.finish_if_exhausted() {
        if pacer.wait_polling(render, None, DataWait::Nothing).await == Wake::Stopped {
            return;
        }
    }
}

/// Drain audio in key order; the sink paces itself
async fn audio_lane<A: AudioSink>(mut pacer: Pacer, audio: &mut A) {
    let kind = MediaKind::Audio;

    loop {
        let state = pacer.state();
        if state.stopped {
            return;
        }
        if !state.can_emit() {
            if pacer.wait(None, DataWait::Nothing).await == Wake::Stopped {
                return;
            }
            continue;
        }

        pacer.evict_stale(&state, kind);

        match pacer.buffer.pop_min(kind) {
            Some(unit) => {
                if !pacer.emit_audio(audio, unit).await {
                    return;
                }
            }
            None if pacer.buffer.is_drained(kind) => break,
            None => {
                if pacer.wait(None, DataWait::Stream(kind)).await == Wake::Stopped {
                    return;
                }
            }
        }
    }

    info!("Scheduler: audio stream finished");
    pacer.finish_if_exhausted();
}

#[async_trait]
impl<V: RenderSink, A: AudioSink> PipelineStage for PlaybackScheduler<V, A> {
    async fn run(&mut self) -> Result<()> {
        info!(
            "Scheduler: started ({:?} keys, warm-up {:?}, tolerance {:.3}s)",
            self.buffer.key_kind(),
            self.config.warm_up,
            self.config.tolerance
        );

        if self.await_start().await {
            match self.buffer.key_kind() {
                KeyKind::Sequential => self.run_sequential().await,
                KeyKind::Timestamp => self.run_timestamp().await,
            }
        }

        self.shutdown().await?;
        let summary = self.health.summary();
        info!(
            "Scheduler: finished ({} video / {} audio emitted, {} / {} dropped)",
            summary.video.emitted,
            summary.audio.emitted,
            summary.video.dropped(),
            summary.audio.dropped()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Scheduler"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.render.close().await;
        self.audio.close().await;
        Ok(())
    }
}
