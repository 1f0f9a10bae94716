//! Pumping one physical connection
//!
//! A [`Relay`] ties the two directions of a logical tunnel to whichever
//! physical connection is current. [`Relay::run`] drives one connection
//! until it breaks, the tunnel completes, or the cancellation token fires.
//! The counters live in [`Outbound`] / [`Inbound`], so a later `run` on a new
//! connection continues exactly where the previous one stopped.

use crate::sequence::{Inbound, Outbound, Pending, SequenceError};
use crate::transport::{FrameSink, FrameSource, TransportError};
use relaygate_proto::{ControlMessage, Frame, FrameError, FrameType, RejectCode};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Relay errors, all terminal for the session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer rejected the session ({code}): {reason}")]
    Rejected { code: RejectCode, reason: String },

    #[error("Unexpected control message: {0:?}")]
    UnexpectedControl(ControlMessage),
}

impl RelayError {
    /// Code to report to the peer when this error ends a session
    pub fn reject_code(&self) -> RejectCode {
        match self {
            RelayError::Frame(_) | RelayError::UnexpectedControl(_) => RejectCode::Malformed,
            RelayError::Sequence(SequenceError::Desync(_)) => RejectCode::Desync,
            RelayError::Sequence(_) | RelayError::Transport(_) => RejectCode::SessionClosed,
            RelayError::Rejected { code, .. } => *code,
        }
    }
}

/// How a physical connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkExit {
    /// Both directions finished and were acknowledged
    Completed,
    /// The physical connection broke; the tunnel can resume on a new one
    Disconnected,
    /// The cancellation token fired or the streams were closed locally
    Cancelled,
}

/// Pumps frames between a physical connection and the two stream directions
#[derive(Clone)]
pub struct Relay {
    outbound: Arc<Outbound>,
    inbound: Arc<Inbound>,
}

impl Relay {
    pub fn new(outbound: Arc<Outbound>, inbound: Arc<Inbound>) -> Self {
        Self { outbound, inbound }
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    pub fn inbound(&self) -> &Arc<Inbound> {
        &self.inbound
    }

    /// Both directions finished and acknowledged
    pub fn is_complete(&self) -> bool {
        self.outbound.is_complete() && self.inbound.is_complete()
    }

    /// Pump one physical connection, sending from `resume_at` onwards
    ///
    /// Transport failures end the call with [`LinkExit::Disconnected`]; errors
    /// are protocol failures that must tear the session down.
    pub async fn run<K, S>(
        &self,
        sink: &mut K,
        source: &mut S,
        resume_at: u64,
        cancel: &CancellationToken,
    ) -> Result<LinkExit, RelayError>
    where
        K: FrameSink + ?Sized,
        S: FrameSource + ?Sized,
    {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(LinkExit::Cancelled),
            result = self.write_loop(sink, resume_at) => result,
            result = self.read_loop(source) => result,
        };

        match result {
            Err(RelayError::Sequence(SequenceError::Closed)) => Ok(LinkExit::Cancelled),
            other => other,
        }
    }

    async fn write_loop<K>(&self, sink: &mut K, resume_at: u64) -> Result<LinkExit, RelayError>
    where
        K: FrameSink + ?Sized,
    {
        let mut cursor = resume_at;
        let mut fin_sent = false;

        // The handshake carries offsets only, so restate the end-of-stream state.
        let mut last_ack = self.inbound.ack_state();
        if !send(sink, Frame::ack(last_ack.0, last_ack.1)).await? {
            return Ok(LinkExit::Disconnected);
        }

        loop {
            if last_ack.1 && self.outbound.is_complete() {
                return Ok(LinkExit::Completed);
            }

            tokio::select! {
                pending = self.outbound.next_pending(cursor, fin_sent) => {
                    let (delivered, _) = self.inbound.ack_state();
                    let frame = match pending? {
                        Pending::Data { offset, payload } => {
                            trace!("Sending {} bytes at offset {}", payload.len(), offset);
                            cursor = offset + payload.len() as u64;
                            Frame::data(delivered, offset, payload)
                        }
                        Pending::Fin { length } => {
                            debug!("Sending end of stream at {}", length);
                            fin_sent = true;
                            Frame::fin(delivered, length)
                        }
                    };
                    if !send(sink, frame).await? {
                        return Ok(LinkExit::Disconnected);
                    }
                    last_ack.0 = delivered;
                }
                ack = self.inbound.ack_changed(last_ack) => {
                    if !send(sink, Frame::ack(ack.0, ack.1)).await? {
                        return Ok(LinkExit::Disconnected);
                    }
                    last_ack = ack;
                }
                result = self.outbound.completed(), if last_ack.1 => {
                    result?;
                    return Ok(LinkExit::Completed);
                }
            }
        }
    }

    async fn read_loop<S>(&self, source: &mut S) -> Result<LinkExit, RelayError>
    where
        S: FrameSource + ?Sized,
    {
        loop {
            let raw = match source.recv_frame().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("Relay connection closed by peer");
                    return Ok(self.exit_on_close());
                }
                Err(e) => {
                    debug!("Relay connection failed: {}", e);
                    return Ok(self.exit_on_close());
                }
            };

            let frame = Frame::decode(raw)?;
            match frame.frame_type {
                FrameType::Data => {
                    self.outbound.acknowledge(frame.ack)?;
                    self.inbound.accept(frame.offset, frame.payload)?;
                }
                FrameType::Fin => {
                    self.outbound.acknowledge(frame.ack)?;
                    self.inbound.finish(frame.offset)?;
                }
                FrameType::Ack => {
                    self.outbound.acknowledge(frame.ack)?;
                    if frame.flags.has_fin() {
                        self.outbound.peer_finished()?;
                    }
                }
                FrameType::Control => match frame.control_message()? {
                    ControlMessage::Reject { code, reason } => {
                        return Err(RelayError::Rejected { code, reason });
                    }
                    other => return Err(RelayError::UnexpectedControl(other)),
                },
            }
        }
    }

    fn exit_on_close(&self) -> LinkExit {
        if self.is_complete() {
            LinkExit::Completed
        } else {
            LinkExit::Disconnected
        }
    }
}

/// Send a frame, `Ok(false)` if the connection is gone
async fn send<K>(sink: &mut K, frame: Frame) -> Result<bool, RelayError>
where
    K: FrameSink + ?Sized,
{
    let encoded = frame.encode()?;
    match sink.send_frame(encoded).await {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!("Relay send failed: {}", e);
            Ok(false)
        }
    }
}

/// Send a control message
pub async fn send_control<K>(sink: &mut K, message: &ControlMessage) -> Result<(), RelayError>
where
    K: FrameSink + ?Sized,
{
    let frame = Frame::control(message)?;
    sink.send_frame(frame.encode()?).await?;
    Ok(())
}

/// Receive the next frame and decode it as a control message
pub async fn recv_control<S>(source: &mut S) -> Result<ControlMessage, RelayError>
where
    S: FrameSource + ?Sized,
{
    let raw = source
        .recv_frame()
        .await?
        .ok_or(TransportError::ConnectionClosed)?;
    let frame = Frame::decode(raw)?;
    Ok(frame.control_message()?)
}

/// Report a terminal failure to the peer and close the connection
pub async fn reject<K>(sink: &mut K, code: RejectCode, reason: impl Into<String>)
where
    K: FrameSink + ?Sized,
{
    let message = ControlMessage::Reject {
        code,
        reason: reason.into(),
    };
    if let Err(e) = send_control(sink, &message).await {
        debug!("Failed to send reject: {}", e);
    }
    let _ = sink.close().await;
}
