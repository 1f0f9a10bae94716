//! Reconnectable tunnel client
//!
//! A [`Tunnel`] carries one reliable byte stream in each direction between
//! the application and a backend behind the gateway. The physical WebSocket
//! connection underneath may break at any time; [`Tunnel::keep_connected`]
//! reconnects and resumes at the right offsets, so `send` and `receive`
//! never see a gap, a duplicate or a reordering.

use crate::config::TunnelOptions;
use crate::error::TunnelError;
use futures_util::StreamExt;
use relaygate_connection::relay::{recv_control, reject, send_control};
use relaygate_connection::{
    BufferPool, FrameSink, FrameSource, Inbound, LinkExit, Outbound, ReconnectError,
    ReconnectManager, Relay, RelayError,
};
use relaygate_proto::{ControlMessage, RejectCode, MAX_PAYLOAD, RELAY_PATH};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, HOST};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Connection state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl TunnelState {
    fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closing | TunnelState::Closed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of tunnel counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStats {
    pub state: TunnelState,
    pub session_id: Option<String>,
    /// Physical connections attempted after the first one
    pub reconnects: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Bytes of `bytes_sent` the gateway confirmed delivered to the backend
    pub bytes_acked: u64,
}

struct TunnelInner {
    pool: BufferPool,
    target_host: String,
    target_port: u16,
    options: TunnelOptions,
    relay: Relay,
    session_id: Mutex<Option<String>>,
    state: watch::Sender<TunnelState>,
    cancel: CancellationToken,
    reconnects: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Handle to a tunnel, cheap to clone
///
/// `keep_connected`, `send` and `receive` are meant to run concurrently on
/// clones of the same handle.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &format!("{}:{}", self.inner.target_host, self.inner.target_port))
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    /// Create a disconnected tunnel to `target_host:target_port`
    ///
    /// No network I/O happens until [`keep_connected`](Self::keep_connected).
    pub fn open(
        pool: BufferPool,
        target_host: &str,
        target_port: u16,
        options: TunnelOptions,
    ) -> Result<Self, TunnelError> {
        if target_host.is_empty() {
            return Err(TunnelError::InvalidTarget("empty host".to_string()));
        }
        if target_port == 0 {
            return Err(TunnelError::InvalidTarget("port 0".to_string()));
        }
        if options.replay_window == 0 || options.receive_window == 0 {
            return Err(TunnelError::InvalidTarget(
                "replay window and receive window must be positive".to_string(),
            ));
        }

        let max_chunk = pool.buffer_size().min(MAX_PAYLOAD);
        let relay = Relay::new(
            Arc::new(Outbound::new(options.replay_window, max_chunk)),
            Arc::new(Inbound::new(options.receive_window)),
        );
        let (state, _) = watch::channel(TunnelState::Disconnected);

        Ok(Self {
            inner: Arc::new(TunnelInner {
                pool,
                target_host: target_host.to_string(),
                target_port,
                options,
                relay,
                session_id: Mutex::new(None),
                state,
                cancel: CancellationToken::new(),
                reconnects: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        })
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap().clone()
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            state: self.state(),
            session_id: self.session_id(),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            bytes_acked: self.inner.relay.outbound().acked(),
        }
    }

    /// Move to `next` unless the tunnel is already closing
    fn set_state(&self, next: TunnelState) {
        self.inner.state.send_if_modified(|state| {
            let allowed = !state.is_terminal()
                || (*state == TunnelState::Closing && next == TunnelState::Closed);
            if allowed && *state != next {
                debug!("Tunnel state {} -> {}", state, next);
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Close the tunnel
    ///
    /// Idempotent. Blocked `send`, `receive` and `keep_connected` calls
    /// return promptly and retained buffers go back to the pool.
    pub fn close(&self) {
        if self.state() == TunnelState::Closed {
            return;
        }
        self.set_state(TunnelState::Closing);
        self.inner.cancel.cancel();
        self.inner.relay.outbound().close();
        self.inner.relay.inbound().close();
        self.set_state(TunnelState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Run the reconnect supervisor against the gateway at `relay_url`
    ///
    /// Returns `Ok` once the tunnel completed or was closed, and an error
    /// when the tunnel failed for good (authorization refused at the
    /// upgrade, relay reject, desync, reconnection attempts exhausted).
    pub async fn keep_connected(&self, relay_url: &Url) -> Result<(), TunnelError> {
        let url = relay_endpoint(relay_url)?;
        let mut reconnect = ReconnectManager::new(self.inner.options.reconnect.clone());
        let mut first = true;

        loop {
            if self.is_closed() {
                return Ok(());
            }
            if !first {
                self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            first = false;

            self.set_state(TunnelState::Connecting);
            match self.connect_once(&url, &mut reconnect).await {
                Ok(LinkExit::Completed) => {
                    info!(
                        "Tunnel to {}:{} completed",
                        self.inner.target_host, self.inner.target_port
                    );
                    self.close();
                    return Ok(());
                }
                Ok(LinkExit::Cancelled) => return Ok(()),
                Ok(LinkExit::Disconnected) => {
                    debug!(
                        "Relay connection lost, reconnecting in about {:?}",
                        reconnect.current_backoff()
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!("Relay connection to {} failed: {}", url, e);
                }
                Err(TunnelError::Closed) => return Ok(()),
                Err(e) => {
                    error!("Tunnel failed: {}", e);
                    self.close();
                    return Err(e);
                }
            }

            self.set_state(TunnelState::Disconnected);
            match reconnect.wait_or_cancel(&self.inner.cancel).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(ReconnectError::MaxAttemptsReached) => {
                    error!("Giving up after {} attempts", reconnect.attempt() - 1);
                    self.close();
                    return Err(TunnelError::RetriesExhausted);
                }
            }
        }
    }

    async fn connect_once(
        &self,
        url: &Url,
        reconnect: &mut ReconnectManager,
    ) -> Result<LinkExit, TunnelError> {
        let request = self.upgrade_request(url)?;
        let cancel = &self.inner.cancel;

        debug!("Connecting to relay {}", url);
        let (ws, _response) = tokio::select! {
            result = tokio_tungstenite::connect_async(request) => result?,
            _ = cancel.cancelled() => return Ok(LinkExit::Cancelled),
        };
        let (mut sink, mut source) = ws.split();

        let handshake = tokio::time::timeout(
            self.inner.options.handshake_timeout,
            self.handshake(&mut sink, &mut source),
        );
        let resume_at = tokio::select! {
            result = handshake => match result {
                Ok(result) => result?,
                Err(_) => return Err(TunnelError::HandshakeTimeout),
            },
            _ = cancel.cancelled() => return Ok(LinkExit::Cancelled),
        };

        reconnect.reset();
        self.set_state(TunnelState::Connected);
        info!(
            "Tunnel connected to {}:{} via {} (session {}, resuming at {})",
            self.inner.target_host,
            self.inner.target_port,
            url,
            self.session_id().unwrap_or_default(),
            resume_at
        );

        let sent_before = self.inner.relay.outbound().acked();
        let result = self
            .inner
            .relay
            .run(&mut sink, &mut source, resume_at, cancel)
            .await;
        debug!(
            "Relay link ended, {} bytes acknowledged on it",
            self.inner.relay.outbound().acked() - sent_before
        );

        match result {
            Ok(exit) => {
                let _ = FrameSink::close(&mut sink).await;
                Ok(exit)
            }
            Err(RelayError::Rejected { code, reason }) => self.rejected(code, reason),
            Err(e) => {
                reject(&mut sink, e.reject_code(), e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Exchange counters with the gateway, returning the offset to send from
    async fn handshake<K, S>(&self, sink: &mut K, source: &mut S) -> Result<u64, TunnelError>
    where
        K: FrameSink + ?Sized,
        S: FrameSource + ?Sized,
    {
        let outbound = self.inner.relay.outbound();
        let inbound = self.inner.relay.inbound();
        let current = self.session_id();

        let hello = match &current {
            None => ControlMessage::Open {
                host: self.inner.target_host.clone(),
                port: self.inner.target_port,
                window: inbound.window(),
            },
            Some(session_id) => ControlMessage::Resume {
                session_id: session_id.clone(),
                ack: inbound.delivered(),
                pos: outbound.written(),
                window: inbound.window(),
            },
        };
        send_control(sink, &hello).await?;

        match recv_control(source).await? {
            ControlMessage::Ready {
                session_id,
                ack,
                pos,
                window,
            } => {
                if let Some(current) = &current {
                    if *current != session_id {
                        return Err(TunnelError::Desync(format!(
                            "resumed session {} but the relay answered for {}",
                            current, session_id
                        )));
                    }
                }
                let delivered = inbound.delivered();
                if pos < delivered {
                    return Err(TunnelError::Desync(format!(
                        "relay wrote {} bytes but {} were already delivered",
                        pos, delivered
                    )));
                }
                let resume_at = outbound.resume(ack)?;
                outbound.set_peer_window(window);
                *self.inner.session_id.lock().unwrap() = Some(session_id);
                Ok(resume_at)
            }
            ControlMessage::Reject { code, reason } => Err(TunnelError::Rejected { code, reason }),
            other => Err(TunnelError::ProtocolError(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }

    fn rejected(&self, code: RejectCode, reason: String) -> Result<LinkExit, TunnelError> {
        // The gateway tears a session down once both directions completed,
        // or after its grace period once the backend's stream was delivered.
        let backend_done = match code {
            RejectCode::SessionClosed => self.inner.relay.inbound().is_complete(),
            RejectCode::UnknownSession => self.inner.relay.is_complete(),
            _ => false,
        };
        if backend_done {
            debug!("Relay closed the session after the backend finished: {}", reason);
            return Ok(LinkExit::Completed);
        }
        Err(TunnelError::Rejected { code, reason })
    }

    fn upgrade_request(&self, url: &Url) -> Result<Request, TunnelError> {
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        if let Some(authorization) = &self.inner.options.authorization {
            let value = HeaderValue::from_str(authorization)
                .map_err(|e| TunnelError::InvalidUrl(format!("invalid authorization: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(host) = &self.inner.options.host_header {
            let value = HeaderValue::from_str(host)
                .map_err(|e| TunnelError::InvalidUrl(format!("invalid host header: {}", e)))?;
            headers.insert(HOST, value);
        }
        Ok(request)
    }

    /// Pump `reader` into the tunnel until it reaches end of file
    ///
    /// Returns the number of bytes sent. End of file is forwarded to the
    /// backend as end of stream.
    pub async fn send<R>(&self, mut reader: R) -> Result<u64, TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let cancel = &self.inner.cancel;
        let outbound = self.inner.relay.outbound();
        let mut total = 0u64;

        loop {
            let mut buffer = tokio::select! {
                buffer = self.inner.pool.get() => buffer,
                _ = cancel.cancelled() => return Err(TunnelError::Closed),
            };

            let n = tokio::select! {
                result = reader.read(buffer.spare_mut()) => result?,
                _ = cancel.cancelled() => return Err(TunnelError::Closed),
            };
            if n == 0 {
                outbound.finish();
                debug!("Tunnel send finished after {} bytes", total);
                return Ok(total);
            }

            buffer.set_len(n);
            outbound.append(buffer).await?;
            total += n as u64;
            self.inner.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Pump the tunnel into `writer` until the backend ends its stream
    ///
    /// Returns the number of bytes received; `writer` is shut down at the end.
    pub async fn receive<W>(&self, mut writer: W) -> Result<u64, TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        let cancel = &self.inner.cancel;
        let inbound = self.inner.relay.inbound();
        let mut total = 0u64;

        loop {
            let chunk = tokio::select! {
                chunk = inbound.recv() => chunk,
                _ = cancel.cancelled() => return Err(TunnelError::Closed),
            };

            let Some(chunk) = chunk else {
                if !inbound.is_complete() {
                    return Err(TunnelError::Closed);
                }
                writer.shutdown().await?;
                debug!("Tunnel receive finished after {} bytes", total);
                return Ok(total);
            };

            tokio::select! {
                result = writer.write_all(&chunk) => result?,
                _ = cancel.cancelled() => return Err(TunnelError::Closed),
            }
            writer.flush().await?;
            inbound.consumed(chunk.len());
            total += chunk.len() as u64;
            self.inner
                .bytes_received
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    }
}

/// WebSocket URL of the tunnel endpoint of a gateway
///
/// `http` and `https` map to `ws` and `wss`; the path is always the relay path.
pub fn relay_endpoint(gateway: &Url) -> Result<Url, TunnelError> {
    let scheme = match gateway.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TunnelError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                other
            )))
        }
    };
    if gateway.host_str().is_none() {
        return Err(TunnelError::InvalidUrl(format!("{} has no host", gateway)));
    }

    let mut url = gateway.clone();
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::InvalidUrl(gateway.to_string()))?;
    url.set_path(RELAY_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
