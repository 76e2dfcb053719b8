//! Playback state management

use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Transport command delivered on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Play,
    Pause,
    Stop,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 3] =
        [ControlCommand::Play, ControlCommand::Pause, ControlCommand::Stop];

    pub fn token(&self) -> &'static str {
        match self {
            ControlCommand::Play => "PLAY",
            ControlCommand::Pause => "PAUSE",
            ControlCommand::Stop => "STOP",
        }
    }
}

impl std::str::FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlCommand::ALL
            .into_iter()
            .find(|cmd| cmd.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown control command '{s}'"))
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Why a session reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// STOP received on the control channel
    Command,
    /// Control connection closed by the peer
    ControlClosed,
    /// Render sink reported a user quit
    UserQuit,
    /// Process interrupt (Ctrl-C)
    Interrupted,
    /// Both streams ended and every buffered unit was played
    EndOfStream,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::Command => "stop command",
            StopReason::ControlClosed => "control channel closed",
            StopReason::UserQuit => "user quit",
            StopReason::Interrupted => "interrupted",
            StopReason::EndOfStream => "end of stream",
        };
        f.write_str(text)
    }
}

/// Playback state machine
///
/// ```text
/// WaitingToStart -> Playing <-> Paused -> Stopped
/// ```
///
/// Any state may move to `Stopped`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// Presentation clock not established yet
    WaitingToStart,
    /// Units are being emitted
    Playing,
    /// Emission halted, receivers keep buffering
    Paused,
    /// Session over
    Stopped,
}

impl PlaybackPhase {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PlaybackPhase) -> bool {
        use PlaybackPhase::*;

        match (self, target) {
            (WaitingToStart, Playing) => true,
            (WaitingToStart, Paused) => true, // PAUSE received before the clock started
            (Paused, WaitingToStart) => true, // PLAY undoing that early PAUSE
            (Playing, Paused) => true,
            (Paused, Playing) => true,
            (Stopped, _) => false,
            (_, Stopped) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PlaybackPhase::WaitingToStart => "WaitingToStart",
            PlaybackPhase::Playing => "Playing",
            PlaybackPhase::Paused => "Paused",
            PlaybackPhase::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Shared playback state
///
/// `clock_epoch` is assigned once. Paused time is accumulated in
/// `paused_total` and excluded from the presentation clock, so targets
/// computed before a pause stay meaningful after resume. `skipped` is
/// presentation time jumped over when the buffered data has moved past the
/// clock, which happens after a pause longer than the staleness horizon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackState {
    pub clock_epoch: Option<Instant>,
    pub paused: bool,
    pub stopped: bool,
    pub paused_at: Option<Instant>,
    pub paused_total: Duration,
    pub skipped: Duration,
    pub stop_reason: Option<StopReason>,
}

impl PlaybackState {
    pub fn phase(&self) -> PlaybackPhase {
        if self.stopped {
            PlaybackPhase::Stopped
        } else if !self.is_started() && !self.paused {
            PlaybackPhase::WaitingToStart
        } else if self.paused {
            PlaybackPhase::Paused
        } else {
            PlaybackPhase::Playing
        }
    }

    pub fn is_started(&self) -> bool {
        self.clock_epoch.is_some()
    }

    /// Whether units may be emitted right now
    pub fn can_emit(&self) -> bool {
        self.is_started() && !self.paused && !self.stopped
    }

    /// Apply a control command. Returns `true` if the state changed.
    pub fn apply(&mut self, command: ControlCommand, now: Instant) -> bool {
        match command {
            ControlCommand::Play => self.resume(now),
            ControlCommand::Pause => self.pause(now),
            ControlCommand::Stop => self.stop(StopReason::Command),
        }
    }

    fn pause(&mut self, now: Instant) -> bool {
        if self.stopped || self.paused {
            return false;
        }
        self.paused = true;
        if self.clock_epoch.is_some() {
            self.paused_at = Some(now);
        }
        true
    }

    fn resume(&mut self, now: Instant) -> bool {
        if self.stopped || !self.paused {
            return false;
        }
        self.paused = false;
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(paused_at);
        }
        true
    }

    /// Enter the terminal state. Returns `false` if already stopped.
    pub fn stop(&mut self, reason: StopReason) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.stop_reason = Some(reason);
        true
    }

    /// Start the presentation clock. Only the first call has an effect.
    pub fn establish_epoch(&mut self, now: Instant) -> bool {
        if self.stopped || self.clock_epoch.is_some() {
            return false;
        }
        self.clock_epoch = Some(now);
        if self.paused {
            self.paused_at = Some(now);
        }
        true
    }

    /// Move the presentation position forward by `lead`
    pub fn skip_ahead(&mut self, lead: Duration) -> bool {
        if !self.can_emit() || lead.is_zero() {
            return false;
        }
        self.skipped += lead;
        true
    }

    /// Presentation time elapsed since the epoch, excluding paused time
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        let epoch = self.clock_epoch?;
        let reference = self.paused_at.unwrap_or(now);
        Some(
            reference
                .saturating_duration_since(epoch)
                .saturating_sub(self.paused_total)
                + self.skipped,
        )
    }

    /// Wall-clock instant at which presentation offset `offset` is due
    pub fn target_instant(&self, offset: Duration) -> Option<Instant> {
        self.clock_epoch
            .map(|epoch| epoch + self.paused_total + offset.saturating_sub(self.skipped))
    }
}

/// Synchronized transition interface to the playback state
///
/// The scheduler, the control listener, the render quit poll and the process
/// interrupt handler all go through this handle. Observers subscribe to a
/// `watch` channel so waits can be preempted by any transition. Stopping
/// also cancels the session token that every task selects on.
#[derive(Clone)]
pub struct PlaybackControl {
    state: Arc<watch::Sender<PlaybackState>>,
    cancel: CancellationToken,
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PlaybackState::default());
        Self {
            state: Arc::new(tx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.state.borrow().phase()
    }

    /// Token cancelled when the session stops
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply a control command, returning whether it changed anything
    pub fn request(&self, command: ControlCommand) -> bool {
        if command == ControlCommand::Stop {
            return self.stop(StopReason::Command);
        }
        let now = Instant::now();
        let before = self.phase();
        let changed = self.transition(|state| state.apply(command, now));
        if changed {
            info!(
                "PlaybackControl: {} ({} -> {})",
                command,
                before,
                self.phase()
            );
        }
        changed
    }

    /// Apply `change` to a copy and publish it only if the phase move is allowed
    fn transition(&self, change: impl FnOnce(&mut PlaybackState) -> bool) -> bool {
        self.state.send_if_modified(|state| {
            let mut next = state.clone();
            if !change(&mut next) || !state.phase().can_transition_to(&next.phase()) {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Stop the session. Idempotent; the first reason wins.
    pub fn stop(&self, reason: StopReason) -> bool {
        let changed = self.transition(|state| state.stop(reason));
        if changed {
            info!("PlaybackControl: stopped ({})", reason);
        }
        self.cancel.cancel();
        changed
    }

    /// Start the presentation clock at `now`; no-op after the first call
    pub fn establish_epoch(&self, now: Instant) -> bool {
        let changed = self.transition(|state| state.establish_epoch(now));
        if changed {
            info!("PlaybackControl: presentation clock started ({})", self.phase());
        }
        changed
    }

    /// Jump the presentation clock forward by `lead`; only while playing
    pub fn skip_ahead(&self, lead: Duration) -> bool {
        let changed = self.transition(|state| state.skip_ahead(lead));
        if changed {
            info!("PlaybackControl: skipped {:?} to catch up with buffered data", lead);
        }
        changed
    }

    /// Resolve once the session has stopped
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use PlaybackPhase::*;

        assert!(WaitingToStart.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Stopped));
        assert!(Paused.can_transition_to(&Stopped));
        assert!(WaitingToStart.can_transition_to(&Stopped));

        // Self-transitions
        assert!(Paused.can_transition_to(&Paused));
    }

    #[test]
    fn test_invalid_transitions() {
        use PlaybackPhase::*;

        assert!(!Stopped.can_transition_to(&Playing));
        assert!(!Stopped.can_transition_to(&Stopped));
        assert!(!Playing.can_transition_to(&WaitingToStart));
        assert!(!Paused.can_transition_to(&WaitingToStart));
    }

    #[test]
    fn test_play_before_start_undoes_early_pause() {
        let control = PlaybackControl::new();
        assert!(control.request(ControlCommand::Pause));
        assert_eq!(control.phase(), PlaybackPhase::Paused);
        assert!(control.request(ControlCommand::Play));
        assert_eq!(control.phase(), PlaybackPhase::WaitingToStart);

        assert!(control.establish_epoch(Instant::now()));
        assert_eq!(control.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_stopped_session_rejects_every_transition() {
        let control = PlaybackControl::new();
        control.stop(StopReason::UserQuit);
        assert!(!control.request(ControlCommand::Play));
        assert!(!control.request(ControlCommand::Pause));
        assert!(!control.establish_epoch(Instant::now()));
        assert!(!control.skip_ahead(Duration::from_secs(1)));
        assert_eq!(control.snapshot().stop_reason, Some(StopReason::UserQuit));
    }

    #[test]
    fn test_skip_ahead_moves_clock_forward() {
        let t0 = Instant::now();
        let mut state = PlaybackState::default();
        state.establish_epoch(t0);

        state.apply(ControlCommand::Pause, t0 + Duration::from_secs(1));
        // Not while paused
        assert!(!state.skip_ahead(Duration::from_secs(3)));
        state.apply(ControlCommand::Play, t0 + Duration::from_secs(6));

        assert!(state.skip_ahead(Duration::from_secs(3)));
        let now = t0 + Duration::from_secs(6);
        assert_eq!(state.elapsed(now), Some(Duration::from_secs(4)));
        // Offset 4 s is due right away, later offsets keep their spacing
        assert_eq!(state.target_instant(Duration::from_secs(4)), Some(now));
        assert_eq!(
            state.target_instant(Duration::from_secs(5)),
            Some(now + Duration::from_secs(1))
        );
        // Offsets already skipped are due immediately
        assert_eq!(state.target_instant(Duration::from_secs(2)), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!("play".parse::<ControlCommand>(), Ok(ControlCommand::Play));
        assert_eq!("PaUsE".parse::<ControlCommand>(), Ok(ControlCommand::Pause));
        assert_eq!("STOP".parse::<ControlCommand>(), Ok(ControlCommand::Stop));
        assert!("SEEK".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_commands_are_idempotent() {
        let now = Instant::now();
        let mut state = PlaybackState::default();
        state.establish_epoch(now);
        assert_eq!(state.phase(), PlaybackPhase::Playing);

        // PLAY while playing is a no-op
        assert!(!state.apply(ControlCommand::Play, now));
        assert_eq!(state.phase(), PlaybackPhase::Playing);

        assert!(state.apply(ControlCommand::Pause, now));
        assert!(!state.apply(ControlCommand::Pause, now));
        assert_eq!(state.phase(), PlaybackPhase::Paused);

        assert!(state.apply(ControlCommand::Stop, now));
        assert!(!state.apply(ControlCommand::Stop, now));
        assert_eq!(state.phase(), PlaybackPhase::Stopped);

        // Stopped is terminal
        assert!(!state.apply(ControlCommand::Play, now));
        assert_eq!(state.stop_reason, Some(StopReason::Command));
    }

    #[test]
    fn test_epoch_is_assigned_once() {
        let now = Instant::now();
        let mut state = PlaybackState::default();
        assert_eq!(state.phase(), PlaybackPhase::WaitingToStart);
        assert!(state.establish_epoch(now));
        assert!(!state.establish_epoch(now + Duration::from_secs(1)));
        assert_eq!(state.clock_epoch, Some(now));
    }

    #[test]
    fn test_paused_time_is_excluded() {
        let t0 = Instant::now();
        let mut state = PlaybackState::default();
        state.establish_epoch(t0);

        state.apply(ControlCommand::Pause, t0 + Duration::from_secs(1));
        // Clock frozen while paused
        assert_eq!(
            state.elapsed(t0 + Duration::from_secs(5)),
            Some(Duration::from_secs(1))
        );

        state.apply(ControlCommand::Play, t0 + Duration::from_secs(3));
        assert_eq!(state.paused_total, Duration::from_secs(2));
        assert_eq!(
            state.elapsed(t0 + Duration::from_secs(4)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            state.target_instant(Duration::from_secs(2)),
            Some(t0 + Duration::from_secs(4))
        );
    }

    #[test]
    fn test_pause_before_start_starts_paused() {
        let t0 = Instant::now();
        let mut state = PlaybackState::default();
        assert!(state.apply(ControlCommand::Pause, t0));
        assert_eq!(state.phase(), PlaybackPhase::Paused);
        assert!(!state.can_emit());

        state.establish_epoch(t0 + Duration::from_secs(1));
        assert_eq!(state.phase(), PlaybackPhase::Paused);
        assert_eq!(state.elapsed(t0 + Duration::from_secs(3)), Some(Duration::ZERO));

        state.apply(ControlCommand::Play, t0 + Duration::from_secs(3));
        assert!(state.can_emit());
        assert_eq!(state.elapsed(t0 + Duration::from_secs(4)), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_control_stop_cancels_session() {
        let control = PlaybackControl::new();
        let mut watcher = control.subscribe();
        let token = control.cancellation();

        assert!(control.request(ControlCommand::Pause));
        assert!(watcher.has_changed().unwrap());
        assert!(watcher.borrow_and_update().paused);

        assert!(control.stop(StopReason::ControlClosed));
        assert!(token.is_cancelled());
        assert!(!control.request(ControlCommand::Stop));
        assert_eq!(
            control.snapshot().stop_reason,
            Some(StopReason::ControlClosed)
        );
        control.stopped().await;
    }
}
