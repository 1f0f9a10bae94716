//! HTTP reverse proxy for plain mappings
//!
//! Requests are forwarded with hyper's HTTP/1 client. Connections are pooled
//! per backend and handed back once the previous response was fully read.
//! Bodies stream in both directions; nothing is buffered here.

use axum::body::Body;
use http::header::{HeaderName, HOST};
use http::{HeaderValue, Request, Response, Uri};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Maximum number of pooled connections per backend
const MAX_POOL_SIZE: usize = 10;

/// Headers that only make sense for a single hop
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid backend {0:?}")]
    InvalidTarget(String),

    #[error("Unsupported backend scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Where a mapping forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host:port` to dial, also sent as `Host`
    pub authority: String,
    /// Path prefix prepended to every forwarded request
    pub base_path: String,
}

impl Target {
    /// Parse `http://host:port/base` or bare `host:port`
    pub fn parse(to: &str) -> Result<Self, ProxyError> {
        let with_scheme = if to.contains("://") {
            to.to_string()
        } else {
            format!("http://{}", to)
        };
        let uri: Uri = with_scheme
            .parse()
            .map_err(|_| ProxyError::InvalidTarget(to.to_string()))?;

        match uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(ProxyError::UnsupportedScheme(
                    other.unwrap_or_default().to_string(),
                ))
            }
        }

        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::InvalidTarget(to.to_string()))?;
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            authority: format!("{}:{}", authority.host(), port),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }
}

type Sender = http1::SendRequest<Body>;

/// HTTP proxy with per-backend connection pooling
#[derive(Clone)]
pub struct HttpProxy {
    pool: Arc<Mutex<HashMap<String, Vec<Sender>>>>,
    dial_timeout: Duration,
}

impl HttpProxy {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(Mutex::new(HashMap::new())),
            dial_timeout,
        }
    }

    /// Get a pooled connection or dial a new one
    async fn connection(&self, authority: &str) -> Result<Sender, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(idle) = pool.get_mut(authority) {
                while let Some(sender) = idle.pop() {
                    if sender.is_ready() {
                        debug!("Reusing pooled connection to {}", authority);
                        return Ok(sender);
                    }
                    debug!("Discarding stale connection from pool");
                }
            }
        }

        debug!("Creating new connection to {}", authority);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| ProxyError::ConnectionFailed(format!("{}: timed out", authority)))?
            .map_err(|e| ProxyError::ConnectionFailed(format!("{}: {}", authority, e)))?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    /// Return the connection to the pool once its response has been read
    fn release(&self, authority: String, mut sender: Sender) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if sender.ready().await.is_err() {
                debug!("Not returning closed connection to pool");
                return;
            }
            let mut pool = pool.lock().await;
            let idle = pool.entry(authority).or_default();
            if idle.len() < MAX_POOL_SIZE {
                idle.push(sender);
            }
        });
    }

    /// Forward a request to the backend of a mapping
    pub async fn forward(
        &self,
        target: &Target,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        parts.uri = format!("{}{}", target.base_path, path_and_query)
            .parse()
            .map_err(|e| ProxyError::RequestFailed(format!("invalid request path: {}", e)))?;

        for name in HOP_BY_HOP {
            parts.headers.remove(name);
        }
        if let Some(original) = parts.headers.remove(HOST) {
            parts
                .headers
                .insert(HeaderName::from_static("x-forwarded-host"), original);
        }
        let host = HeaderValue::from_str(&target.authority)
            .map_err(|_| ProxyError::InvalidTarget(target.authority.clone()))?;
        parts.headers.insert(HOST, host);

        debug!("Proxying {} {} to {}", parts.method, parts.uri, target.authority);

        let mut sender = self.connection(&target.authority).await?;
        let response = sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("Failed to send request: {}", e)))?;
        self.release(target.authority.clone(), sender);

        let (mut parts, body) = response.into_parts();
        for name in HOP_BY_HOP {
            parts.headers.remove(name);
        }
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}
