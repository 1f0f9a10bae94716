//! Server half of a tunnel
//!
//! A [`Session`] owns one backend TCP connection and the two stream
//! directions between it and the tunnel client. The backend pumps run for
//! the whole life of the session; physical connections come and go through
//! [`Session::serve`]. At most one physical connection is pumped at a time:
//! attaching a new one cancels the current pump and waits for it to let go
//! of the session before the resume handshake is answered.

use crate::metrics::{Direction, GatewayMetrics};
use relaygate_connection::relay::{reject, send_control};
use relaygate_connection::{
    BufferPool, FrameSink, FrameSource, Inbound, LinkExit, Outbound, Relay, RelayError,
    SequenceError,
};
use relaygate_proto::{ControlMessage, RejectCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Resume desync: {0}")]
    Desync(String),

    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl SessionError {
    pub fn reject_code(&self) -> RejectCode {
        match self {
            SessionError::Desync(_) => RejectCode::Desync,
            SessionError::Closed => RejectCode::SessionClosed,
            SessionError::Relay(e) => e.reject_code(),
        }
    }
}

/// Per-session limits and timers
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub replay_window: usize,
    /// Bytes accepted from the client beyond what the backend took
    pub receive_window: u64,
    /// How long a session may go without a physical connection
    pub keepalive_timeout: Duration,
    /// How long a session lingers after its backend closed
    pub grace_period: Duration,
}

/// Offsets a reconnecting client presents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// Bytes the client delivered to its application
    pub ack: u64,
    /// Bytes the client has written into the tunnel
    pub pos: u64,
}

pub struct Session {
    id: String,
    identity: String,
    backend: String,
    relay: Relay,
    settings: SessionSettings,
    metrics: GatewayMetrics,
    /// Cancels the pump of the current physical connection
    link: Mutex<Option<CancellationToken>>,
    /// Held for the lifetime of a pump
    pump: tokio::sync::Mutex<()>,
    attached: watch::Sender<bool>,
    backend_closed: CancellationToken,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Create a session around a dialed backend and start its pumps
    pub fn start(
        id: String,
        identity: String,
        stream: TcpStream,
        pool: BufferPool,
        settings: SessionSettings,
        metrics: GatewayMetrics,
    ) -> Arc<Self> {
        let backend = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let relay = Relay::new(
            Arc::new(Outbound::new(settings.replay_window, pool.buffer_size())),
            Arc::new(Inbound::new(settings.receive_window)),
        );
        let (attached, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            identity,
            backend,
            relay,
            settings,
            metrics,
            link: Mutex::new(None),
            pump: tokio::sync::Mutex::new(()),
            attached,
            backend_closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        session.metrics.session_created();

        let (reader, writer) = stream.into_split();
        tokio::spawn(session.clone().read_backend(reader, pool));
        tokio::spawn(session.clone().write_backend(writer));
        tokio::spawn(session.clone().watchdog());

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the backend connection
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session is torn down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Tear the session down, releasing its buffers and backend connection
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Session {} of {} ({}) closed: {}",
            self.id, self.identity, self.backend, reason
        );
        self.shutdown.cancel();
        self.relay.outbound().close();
        self.relay.inbound().close();
        self.metrics.session_closed();
    }

    /// Attach a physical connection and pump it until it ends
    ///
    /// `peer_window` is the receive window the client announced, `resume` is
    /// `None` for the connection that opened the session. The handshake reply
    /// (`Ready` or `Reject`) is sent here.
    pub async fn serve<K, S>(
        self: &Arc<Self>,
        sink: &mut K,
        source: &mut S,
        peer_window: u64,
        resume: Option<ResumePoint>,
    ) -> Result<LinkExit, SessionError>
    where
        K: FrameSink + ?Sized,
        S: FrameSource + ?Sized,
    {
        let link = self.shutdown.child_token();
        if let Some(previous) = self.link.lock().unwrap().replace(link.clone()) {
            debug!("Session {}: replacing physical connection", self.id);
            previous.cancel();
        }

        let _pump = tokio::select! {
            guard = self.pump.lock() => guard,
            _ = link.cancelled() => return self.detach(sink).await,
        };
        if link.is_cancelled() {
            return self.detach(sink).await;
        }

        let inbound = self.relay.inbound();
        let outbound = self.relay.outbound();
        let resume_at = match resume {
            None => 0,
            Some(point) => match self.resume_at(point) {
                Ok(at) => at,
                Err(e) => {
                    warn!("Session {}: {}", self.id, e);
                    self.refuse(sink, &e).await;
                    self.close("resume desync");
                    return Err(e);
                }
            },
        };

        outbound.set_peer_window(peer_window);

        let ready = ControlMessage::Ready {
            session_id: self.id.clone(),
            ack: inbound.delivered(),
            pos: outbound.written(),
            window: inbound.window(),
        };
        if let Err(e) = send_control(sink, &ready).await {
            debug!("Session {}: handshake reply failed: {}", self.id, e);
            return Ok(LinkExit::Disconnected);
        }
        if let Some(point) = resume {
            self.metrics.resumed();
            info!(
                "Session {} resumed (client ack {}, pos {})",
                self.id, point.ack, point.pos
            );
        }

        self.attached.send_replace(true);
        let exit = self.relay.run(sink, source, resume_at, &link).await;
        self.attached.send_replace(false);

        match exit {
            Ok(LinkExit::Completed) => {
                let _ = sink.close().await;
                self.close("completed");
                Ok(LinkExit::Completed)
            }
            Ok(LinkExit::Disconnected) => {
                debug!("Session {}: physical connection lost", self.id);
                Ok(LinkExit::Disconnected)
            }
            Ok(LinkExit::Cancelled) => self.detach(sink).await,
            Err(RelayError::Rejected { code, reason }) => {
                warn!("Session {} rejected by client ({}): {}", self.id, code, reason);
                self.close("rejected by client");
                Err(RelayError::Rejected { code, reason }.into())
            }
            Err(e) => {
                let e = SessionError::from(e);
                warn!("Session {}: {}", self.id, e);
                self.refuse(sink, &e).await;
                self.close("protocol error");
                Err(e)
            }
        }
    }

    fn resume_at(&self, point: ResumePoint) -> Result<u64, SessionError> {
        let delivered = self.relay.inbound().delivered();
        if point.pos < delivered {
            return Err(SessionError::Desync(format!(
                "client wrote {} bytes but {} were delivered",
                point.pos, delivered
            )));
        }
        self.relay
            .outbound()
            .resume(point.ack)
            .map_err(|e| match e {
                SequenceError::Desync(msg) => SessionError::Desync(msg),
                _ => SessionError::Closed,
            })
    }

    /// End a physical connection that lost its pump
    async fn detach<K>(&self, sink: &mut K) -> Result<LinkExit, SessionError>
    where
        K: FrameSink + ?Sized,
    {
        if self.is_closed() {
            self.refuse(sink, &SessionError::Closed).await;
        } else {
            debug!("Session {}: physical connection superseded", self.id);
            let _ = sink.close().await;
        }
        Ok(LinkExit::Cancelled)
    }

    async fn refuse<K>(&self, sink: &mut K, error: &SessionError)
    where
        K: FrameSink + ?Sized,
    {
        let code = error.reject_code();
        self.metrics.rejected(code);
        reject(sink, code, error.to_string()).await;
    }

    /// Backend to client
    async fn read_backend(self: Arc<Self>, mut reader: OwnedReadHalf, pool: BufferPool) {
        let outbound = self.relay.outbound().clone();
        loop {
            let mut buffer = tokio::select! {
                buffer = pool.get() => buffer,
                _ = self.shutdown.cancelled() => return,
            };
            let read = tokio::select! {
                read = reader.read(buffer.spare_mut()) => read,
                _ = self.shutdown.cancelled() => return,
            };
            match read {
                Ok(0) => {
                    debug!("Backend {} closed", self.backend);
                    break;
                }
                Ok(n) => {
                    buffer.set_len(n);
                    if outbound.append(buffer).await.is_err() {
                        return;
                    }
                    self.metrics.relayed(Direction::ToClient, n);
                }
                Err(e) => {
                    debug!("Backend {} read failed: {}", self.backend, e);
                    break;
                }
            }
        }
        outbound.finish();
        self.backend_closed.cancel();
    }

    /// Client to backend
    async fn write_backend(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        let inbound = self.relay.inbound().clone();
        let mut broken = false;
        while let Some(chunk) = inbound.recv().await {
            if !broken {
                let written = tokio::select! {
                    written = writer.write_all(&chunk) => written,
                    _ = self.shutdown.cancelled() => return,
                };
                match written {
                    Ok(()) => self.metrics.relayed(Direction::ToBackend, chunk.len()),
                    Err(e) => {
                        // A reset backend ends the stream; later bytes are dropped.
                        debug!("Backend {} write failed: {}", self.backend, e);
                        broken = true;
                    }
                }
            }
            inbound.consumed(chunk.len());
        }
        if !broken {
            let _ = writer.shutdown().await;
        }
    }

    /// Enforces the keepalive and grace timers
    async fn watchdog(self: Arc<Self>) {
        let mut attached = self.attached.subscribe();
        let grace = async {
            self.backend_closed.cancelled().await;
            tokio::time::sleep(self.settings.grace_period).await;
        };
        tokio::pin!(grace);

        loop {
            let idle = !*attached.borrow_and_update();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = &mut grace => {
                    self.close("backend closed and grace period expired");
                    return;
                }
                _ = tokio::time::sleep(self.settings.keepalive_timeout), if idle => {
                    self.close("no connection within keepalive timeout");
                    return;
                }
                changed = attached.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("backend", &self.backend)
            .field("closed", &self.is_closed())
            .finish()
    }
}
