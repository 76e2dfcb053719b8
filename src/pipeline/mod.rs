//! Synchronized playback pipeline
//!
//! Two independent media connections (video and audio) feed a shared
//! [`SyncBuffer`]. A [`PlaybackScheduler`](receiver::PlaybackScheduler)
//! releases units against a [`PresentationClock`] while a control connection
//! drives the [`PlaybackControl`] state machine.
//!
//! # Architecture
//!
//! - Each stage runs in its own async task and implements [`PipelineStage`]
//! - The buffer is the only data path between receivers and scheduler
//! - Playback state is published through a `watch` channel; every stage
//!   observes stops through one cancellation token
//! - [`SessionHealth`] counts what each stream received, emitted and dropped

pub mod buffer;
pub mod clock;
pub mod health;
pub mod receiver;
pub mod stage;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use buffer::{MatchStep, SyncBuffer};
pub use clock::PresentationClock;
pub use health::{HealthMonitor, HealthSummary, SessionHealth};
pub use stage::PipelineStage;
pub use state::{ControlCommand, PlaybackControl, PlaybackPhase, StopReason};
pub use types::{KeyKind, MediaKind, MediaUnit, PresentationKey, Transport};
