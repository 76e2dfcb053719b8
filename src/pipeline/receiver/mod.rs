//! Receiver pipeline components
//!
//! - StreamReceiver: reads one media connection into the sync buffer
//! - ControlListener: turns control tokens into playback transitions
//! - PlaybackScheduler: releases buffered units to the sinks on time
//! - PlayerCoordinator: owns a session and its tasks
//!
//! ```text
//! Video/Audio conn → Framing → StreamReceiver → SyncBuffer → Scheduler → Render/Audio sink
//! ```

pub mod control_stage;
pub mod coordinator;
pub mod framing;
pub mod receive_stage;
pub mod sync_stage;

pub use control_stage::{CommandCodec, ControlListener, ControlMessage};
pub use coordinator::{PlayerCoordinator, SessionConfig, SessionReport};
pub use receive_stage::{ReceiverConfig, StreamReceiver};
pub use sync_stage::{PlaybackScheduler, SchedulerConfig};
