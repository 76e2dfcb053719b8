//! Player session coordinator
//!
//! Spawns one task per stream receiver, the control listener, the playback
//! scheduler and the health monitor, then waits for the session to stop and
//! tears everything down.
//!
//! ```text
//! video conn ─► StreamReceiver ─┐
//!                               ├─► SyncBuffer ─► PlaybackScheduler ─► sinks
//! audio conn ─► StreamReceiver ─┘                      ▲
//! control conn ─► ControlListener ─► PlaybackControl ──┘
//! ```

use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};

use super::control_stage::ControlListener;
use super::receive_stage::{ReceiverConfig, StreamReceiver};
use super::sync_stage::{PlaybackScheduler, SchedulerConfig};
use crate::display::{AudioSink, EncodedFrameDecoder, FrameDecoder, RenderSink, RgbFrameDecoder};
use crate::pipeline::PipelineStage;
use crate::pipeline::buffer::SyncBuffer;
use crate::pipeline::health::{HealthMonitor, HealthSummary, SessionHealth};
use crate::pipeline::state::{PlaybackControl, StopReason};
use crate::pipeline::types::{MediaKind, Transport};

/// Everything a session needs besides its connections and sinks
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub receiver: ReceiverConfig,
    pub scheduler: SchedulerConfig,
    /// Staleness horizon for buffered units
    pub horizon: Duration,
    /// How long tasks get to finish after a stop before they are aborted
    pub shutdown_grace: Duration,
    pub health_log_interval: Duration,
    pub stall_threshold: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            scheduler: SchedulerConfig::default(),
            horizon: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            health_log_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(5),
        }
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub stop_reason: Option<StopReason>,
    pub clock_epoch: Option<Instant>,
    pub health: HealthSummary,
    /// Tasks that ended with an error, as `(task, message)`
    pub task_errors: Vec<(&'static str, String)>,
}

type TaskResult = (&'static str, Result<()>);

/// Coordinates a single playback session
pub struct PlayerCoordinator {
    config: SessionConfig,
    control: PlaybackControl,
    health: Arc<SessionHealth>,
    buffer: Arc<SyncBuffer>,
    decoder: Arc<dyn FrameDecoder>,
}

impl PlayerCoordinator {
    pub fn new(config: SessionConfig) -> Self {
        let decoder: Arc<dyn FrameDecoder> = match config.receiver.transport {
            Transport::Raw => Arc::new(RgbFrameDecoder),
            Transport::Timestamped => Arc::new(EncodedFrameDecoder),
        };
        Self {
            buffer: Arc::new(SyncBuffer::new(
                config.receiver.transport.key_kind(),
                config.horizon,
            )),
            control: PlaybackControl::new(),
            health: Arc::new(SessionHealth::new()),
            decoder,
            config,
        }
    }

    /// Handle for requesting transitions from outside the session
    pub fn control(&self) -> PlaybackControl {
        self.control.clone()
    }

    fn spawn_stage<S>(tasks: &mut JoinSet<TaskResult>, mut stage: S)
    where
        S: PipelineStage + 'static,
    {
        tasks.spawn(async move {
            let name = stage.name();
            let result = stage.run().await;
            (name, result)
        });
    }

    /// Run the session to completion
    pub async fn run<VR, AR, CR, V, A>(
        self,
        video: VR,
        audio: AR,
        control_conn: CR,
        render: V,
        audio_sink: A,
    ) -> SessionReport
    where
        VR: AsyncRead + Unpin + Send + 'static,
        AR: AsyncRead + Unpin + Send + 'static,
        CR: AsyncRead + Unpin + Send + 'static,
        V: RenderSink + 'static,
        A: AudioSink + 'static,
    {
        let cancel = self.control.cancellation();
        let mut tasks = JoinSet::new();

        Self::spawn_stage(
            &mut tasks,
            StreamReceiver::new(
                MediaKind::Video,
                video,
                self.config.receiver,
                self.decoder.clone(),
                self.buffer.clone(),
                self.health.clone(),
                cancel.clone(),
            ),
        );
        Self::spawn_stage(
            &mut tasks,
            StreamReceiver::new(
                MediaKind::Audio,
                audio,
                self.config.receiver,
                self.decoder.clone(),
                self.buffer.clone(),
                self.health.clone(),
                cancel.clone(),
            ),
        );
        Self::spawn_stage(
            &mut tasks,
            ControlListener::new(control_conn, self.control.clone()),
        );
        Self::spawn_stage(
            &mut tasks,
            PlaybackScheduler::new(
                self.buffer.clone(),
                self.control.clone(),
                self.health.clone(),
                self.config.scheduler,
                render,
                audio_sink,
            ),
        );

        let monitor = HealthMonitor::new(self.health.clone())
            .with_log_interval(self.config.health_log_interval)
            .with_stall_threshold(self.config.stall_threshold);
        let monitor_cancel = cancel.clone();
        tasks.spawn(async move {
            monitor.run(monitor_cancel).await;
            ("HealthMonitor", Ok(()))
        });

        info!(
            "PlayerCoordinator: session started ({} transport)",
            self.config.receiver.transport
        );

        let mut task_errors = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => {
                        if let Some(name) = Self::record(joined, &mut task_errors)
                            && name == "Scheduler"
                        {
                            // Nothing left to play without a scheduler
                            self.control.stop(StopReason::EndOfStream);
                        }
                    }
                    None => break,
                },
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => {
                    Self::record(joined, &mut task_errors);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "PlayerCoordinator: {} tasks still running after {:?}, aborting",
                        tasks.len(),
                        self.config.shutdown_grace
                    );
                    tasks.shutdown().await;
                    break;
                }
            }
        }

        let state = self.control.snapshot();
        let report = SessionReport {
            stop_reason: state.stop_reason,
            clock_epoch: state.clock_epoch,
            health: self.health.summary(),
            task_errors,
        };
        info!(
            "PlayerCoordinator: session ended ({})",
            report
                .stop_reason
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| "no stop reason".into())
        );
        report
    }

    /// Log a finished task, returning its name
    fn record(
        joined: Result<TaskResult, tokio::task::JoinError>,
        errors: &mut Vec<(&'static str, String)>,
    ) -> Option<&'static str> {
        match joined {
            Ok((name, Ok(()))) => {
                info!("PlayerCoordinator: {} finished", name);
                Some(name)
            }
            Ok((name, Err(e))) => {
                error!("{} error: {:#}", name, e);
                errors.push((name, format!("{e:#}")));
                Some(name)
            }
            Err(e) => {
                error!("PlayerCoordinator: task failed: {}", e);
                errors.push(("task", e.to_string()));
                None
            }
        }
    }
}
