//! Request dispatch
//!
//! Every request on the public listener goes through [`Gateway::resolve`]:
//! route by host and path, authenticate if the mapping is private, then
//! either upgrade to a tunnel or reverse proxy to the mapping's backend.

use crate::config::{ConfigError, GatewayConfig};
use crate::metrics::{GatewayMetrics, MetricsError, MetricsRegistry, RequestOutcome};
use crate::policy::TunnelPolicy;
use crate::proxy::{HttpProxy, Target};
use crate::registry::SessionRegistry;
use crate::session::{ResumePoint, SessionSettings};
use crate::websocket::{self, WsSink, WsSource};
use axum::body::Body;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{HOST, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use relaygate_connection::relay::{recv_control, reject};
use relaygate_connection::{BufferPool, RelayError};
use relaygate_http_auth::{AuthRequest, AuthResult, HttpAuthenticator, Identity};
use relaygate_proto::{ControlMessage, RejectCode, RELAY_PATH};
use relaygate_router::{HttpRouter, Mapping};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Gateway construction errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of routing and authenticating a request
#[derive(Debug)]
pub enum Resolution {
    Proxy {
        mapping: Arc<Mapping>,
        identity: Identity,
    },
    Tunnel {
        identity: Identity,
    },
    NotFound,
    Unauthorized {
        reason: String,
        challenge: Option<String>,
    },
}

/// Shared state of the public listener
pub struct Gateway {
    config: GatewayConfig,
    router: HttpRouter,
    authenticator: Option<HttpAuthenticator>,
    tunnels: TunnelPolicy,
    sessions: SessionRegistry,
    pool: BufferPool,
    proxy: HttpProxy,
    metrics: GatewayMetrics,
}

impl Gateway {
    /// Validate the configuration and register metrics
    ///
    /// An explicit `authenticator` takes precedence over the one configured
    /// under `auth`.
    pub fn new(
        config: GatewayConfig,
        authenticator: Option<HttpAuthenticator>,
        metrics: &MetricsRegistry,
    ) -> Result<Self, GatewayError> {
        let authenticator =
            authenticator.or_else(|| config.auth.as_ref().map(HttpAuthenticator::from_config));

        for warning in config.validate(authenticator.is_some())? {
            warn!("{}", warning);
        }

        let router = HttpRouter::from_mappings(&config.mappings)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let tunnels = TunnelPolicy::parse(&config.tunnels).map_err(ConfigError::Invalid)?;
        let pool = BufferPool::new(config.buffer_size, config.pool_capacity);
        let metrics = GatewayMetrics::register(metrics)?;
        metrics.observe_pool(&pool);

        info!(
            "Gateway configured with {} mappings, tunnels {}, auth {}",
            config.mappings.len(),
            if tunnels.is_enabled() { "enabled" } else { "disabled" },
            authenticator
                .as_ref()
                .map(|a| a.auth_type())
                .unwrap_or("none")
        );

        Ok(Self {
            proxy: HttpProxy::new(config.dial_timeout),
            config,
            router,
            authenticator,
            tunnels,
            sessions: SessionRegistry::new(),
            pool,
            metrics,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Route and authenticate a request
    pub fn resolve(&self, request: &AuthRequest) -> Resolution {
        let mapping = match self.router.lookup(&request.host, &request.path) {
            Ok(mapping) => mapping,
            Err(e) => {
                debug!("{}", e);
                return Resolution::NotFound;
            }
        };

        let identity = if mapping.is_public() {
            Identity::new("anonymous")
        } else {
            let Some(authenticator) = &self.authenticator else {
                return Resolution::Unauthorized {
                    reason: "no authenticator configured".to_string(),
                    challenge: None,
                };
            };
            match authenticator.authenticate(request) {
                AuthResult::Authenticated(identity) => identity,
                AuthResult::Unauthorized(reason) => {
                    return Resolution::Unauthorized {
                        reason,
                        challenge: authenticator.challenge(),
                    }
                }
            }
        };

        if request.path == RELAY_PATH {
            return if self.tunnels.is_enabled() {
                Resolution::Tunnel { identity }
            } else {
                Resolution::NotFound
            };
        }

        if mapping.to.is_none() {
            return Resolution::NotFound;
        }
        Resolution::Proxy { mapping, identity }
    }

    fn settings(&self) -> SessionSettings {
        SessionSettings {
            replay_window: self.config.replay_window,
            receive_window: self.config.receive_window,
            keepalive_timeout: self.config.keepalive_timeout,
            grace_period: self.config.grace_period,
        }
    }

    async fn refuse(&self, sink: &mut WsSink, code: RejectCode, reason: String) {
        debug!("Refusing tunnel ({}): {}", code, reason);
        self.metrics.rejected(code);
        reject(sink, code, reason).await;
    }

    /// Run the handshake of an upgraded tunnel connection and pump it
    async fn handle_tunnel(self: Arc<Self>, socket: WebSocket, identity: Identity) {
        let (mut sink, mut source) = websocket::split(socket);

        let hello = match tokio::time::timeout(
            self.config.handshake_timeout,
            recv_control(&mut source),
        )
        .await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(RelayError::Transport(e))) => {
                debug!("Tunnel closed before handshake: {}", e);
                return;
            }
            Ok(Err(e)) => {
                self.refuse(&mut sink, RejectCode::Malformed, e.to_string())
                    .await;
                return;
            }
            Err(_) => {
                self.refuse(
                    &mut sink,
                    RejectCode::Malformed,
                    "handshake timed out".to_string(),
                )
                .await;
                return;
            }
        };

        match hello {
            ControlMessage::Open { host, port, window } => {
                self.open_session(identity, &host, port, window, sink, source)
                    .await
            }
            ControlMessage::Resume {
                session_id,
                ack,
                pos,
                window,
            } => match self.sessions.get(&session_id) {
                Some(session) => {
                    let point = ResumePoint { ack, pos };
                    match session
                        .serve(&mut sink, &mut source, window, Some(point))
                        .await
                    {
                        Ok(exit) => debug!("Session {} link ended: {:?}", session_id, exit),
                        Err(e) => warn!("Session {} failed: {}", session_id, e),
                    }
                }
                None => {
                    self.refuse(
                        &mut sink,
                        RejectCode::UnknownSession,
                        format!("unknown session {}", session_id),
                    )
                    .await
                }
            },
            other => {
                self.refuse(
                    &mut sink,
                    RejectCode::Malformed,
                    format!("unexpected handshake {:?}", other),
                )
                .await
            }
        }
    }

    async fn open_session(
        &self,
        identity: Identity,
        host: &str,
        port: u16,
        window: u64,
        mut sink: WsSink,
        mut source: WsSource,
    ) {
        if !self.tunnels.allows(host, port) {
            self.refuse(
                &mut sink,
                RejectCode::Forbidden,
                format!("{}:{} is not an allowed tunnel target", host, port),
            )
            .await;
            return;
        }

        let dialed =
            tokio::time::timeout(self.config.dial_timeout, TcpStream::connect((host, port))).await;
        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.refuse(
                    &mut sink,
                    RejectCode::BackendUnreachable,
                    format!("{}:{}: {}", host, port, e),
                )
                .await;
                return;
            }
            Err(_) => {
                self.refuse(
                    &mut sink,
                    RejectCode::BackendUnreachable,
                    format!("{}:{}: dial timed out", host, port),
                )
                .await;
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let session = self.sessions.create(
            identity.to_string(),
            stream,
            self.pool.clone(),
            self.settings(),
            self.metrics.clone(),
        );
        info!("{} - connects {}", identity, session.backend());

        match session.serve(&mut sink, &mut source, window, None).await {
            Ok(exit) => debug!("Session {} link ended: {:?}", session.id(), exit),
            Err(e) => warn!("Session {} failed: {}", session.id(), e),
        }
    }
}

/// Extract the parts an authenticator looks at
fn auth_request(request: &Request) -> AuthRequest {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();

    let mut auth_request = AuthRequest::new(request.method().as_str(), host, request.uri().path());
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            auth_request = auth_request.with_header(name.as_str(), value);
        }
    }
    auth_request
}

/// Fallback handler of the public listener
pub async fn dispatch(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let auth_request = auth_request(&request);

    match gateway.resolve(&auth_request) {
        Resolution::NotFound => {
            debug!("No mapping for {}", auth_request.url());
            gateway.metrics.request(RequestOutcome::NotFound);
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Resolution::Unauthorized { reason, challenge } => {
            info!(
                "Unauthorized {} {}: {}",
                auth_request.method,
                auth_request.url(),
                reason
            );
            gateway.metrics.request(RequestOutcome::Unauthorized);
            let mut response = (StatusCode::UNAUTHORIZED, "Not authorized").into_response();
            if let Some(value) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
                response.headers_mut().insert(WWW_AUTHENTICATE, value);
            }
            response
        }
        Resolution::Tunnel { identity } => {
            let (mut parts, _body) = request.into_parts();
            match WebSocketUpgrade::from_request_parts(&mut parts, &gateway).await {
                Ok(upgrade) => {
                    gateway.metrics.request(RequestOutcome::Tunnel);
                    let gateway = gateway.clone();
                    upgrade.on_upgrade(move |socket| gateway.handle_tunnel(socket, identity))
                }
                Err(rejection) => rejection.into_response(),
            }
        }
        Resolution::Proxy { mapping, identity } => {
            debug!("{} {} as {}", auth_request.method, auth_request.url(), identity);
            let forwarded = match mapping.to.as_deref().map(Target::parse) {
                Some(Ok(target)) => gateway.proxy.forward(&target, request).await,
                Some(Err(e)) => Err(e),
                None => return (StatusCode::NOT_FOUND, "Not found").into_response(),
            };
            match forwarded {
                Ok(response) => {
                    gateway.metrics.request(RequestOutcome::Proxied);
                    response
                }
                Err(e) => {
                    warn!("Proxy to {} failed: {}", mapping.from, e);
                    gateway.metrics.request(RequestOutcome::BadGateway);
                    (StatusCode::BAD_GATEWAY, Body::from("Bad gateway")).into_response()
                }
            }
        }
    }
}
