//! Pipeline stage trait
//!
//! Every long-running part of a session (stream receivers, the control
//! listener and the playback scheduler) implements [`PipelineStage`] so the
//! coordinator can spawn and name them uniformly.

use anyhow::Result;
use async_trait::async_trait;

/// A session task that runs until its input ends or the session stops
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage until end of input or session stop
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Release resources held by the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
