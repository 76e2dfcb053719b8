//! Control channel listener
//!
//! Decodes `PLAY` / `PAUSE` / `STOP` tokens from a dedicated connection and
//! requests the matching playback transitions. Closing the connection is an
//! implicit stop.

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use log::{info, warn};
use std::io;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::error::is_disconnect;
use crate::pipeline::PipelineStage;
use crate::pipeline::state::{ControlCommand, PlaybackControl, StopReason};

/// Longest token kept before it is discarded as unknown
pub const MAX_TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Command(ControlCommand),
    Unknown(String),
}

/// Splits a control byte stream into command tokens
///
/// Tokens are case-insensitive and may be separated by whitespace or sent
/// back to back (`PLAYPAUSE`). A token split across reads is held until it
/// completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

impl CommandCodec {
    fn unknown(bytes: BytesMut) -> ControlMessage {
        ControlMessage::Unknown(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Decoder for CommandCodec {
    type Item = ControlMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let blank = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(blank);
        if src.is_empty() {
            return Ok(None);
        }

        for command in ControlCommand::ALL {
            let token = command.token().as_bytes();
            if src.len() >= token.len() && src[..token.len()].eq_ignore_ascii_case(token) {
                src.advance(token.len());
                return Ok(Some(ControlMessage::Command(command)));
            }
        }

        let incomplete = ControlCommand::ALL.iter().any(|command| {
            let token = command.token().as_bytes();
            src.len() < token.len() && token[..src.len()].eq_ignore_ascii_case(&src[..])
        });
        if incomplete {
            return Ok(None);
        }

        match src.iter().position(|b| b.is_ascii_whitespace()) {
            Some(end) => Ok(Some(Self::unknown(src.split_to(end)))),
            None if src.len() > MAX_TOKEN_LEN => {
                let len = src.len();
                Ok(Some(Self::unknown(src.split_to(len))))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            let len = src.len();
            Ok(Some(Self::unknown(src.split_to(len))))
        }
    }
}

/// Control stage: feeds decoded commands into the playback state
pub struct ControlListener<R> {
    frames: FramedRead<R, CommandCodec>,
    control: PlaybackControl,
    cancel: CancellationToken,
    commands: u64,
}

impl<R: AsyncRead + Unpin + Send> ControlListener<R> {
    pub fn new(conn: R, control: PlaybackControl) -> Self {
        let cancel = control.cancellation();
        Self {
            frames: FramedRead::new(conn, CommandCodec),
            control,
            cancel,
            commands: 0,
        }
    }

    /// Commands applied so far
    #[cfg(test)]
    pub fn commands(&self) -> u64 {
        self.commands
    }

    fn handle(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Command(command) => {
                self.commands += 1;
                if !self.control.request(command) {
                    info!("ControlListener: {} had no effect", command);
                }
            }
            ControlMessage::Unknown(token) => {
                warn!("ControlListener: ignoring unknown command '{}'", token);
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PipelineStage for ControlListener<R> {
    async fn run(&mut self) -> Result<()> {
        info!("ControlListener: started");

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("ControlListener: session stopped");
                    return Ok(());
                }
                message = self.frames.next() => message,
            };

            match message {
                Some(Ok(message)) => self.handle(message),
                Some(Err(e)) => {
                    if !is_disconnect(&e) {
                        warn!("ControlListener: read error: {}", e);
                    }
                    break;
                }
                None => break,
            }
        }

        if self.control.stop(StopReason::ControlClosed) {
            info!("ControlListener: connection closed, stopping playback");
        }
        info!("ControlListener: finished ({} commands)", self.commands);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ControlListener"
    }
}
