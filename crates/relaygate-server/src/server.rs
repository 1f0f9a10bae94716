//! Listeners

use crate::config::GatewayConfig;
use crate::gateway::{dispatch, Gateway, GatewayError};
use crate::metrics::MetricsRegistry;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use relaygate_http_auth::HttpAuthenticator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
struct MetricsState {
    gateway: Arc<Gateway>,
    registry: MetricsRegistry,
}

/// A configured gateway, ready to bind its listeners
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    registry: MetricsRegistry,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        authenticator: Option<HttpAuthenticator>,
        registry: MetricsRegistry,
    ) -> Result<Self, GatewayError> {
        let gateway = Gateway::new(config, authenticator, &registry)?;
        Ok(Self {
            gateway: Arc::new(gateway),
            registry,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Router of the public listener
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.gateway.clone())
    }

    /// Router of the metrics listener
    pub fn metrics_router(&self) -> Router {
        Router::new()
            .route("/metrics", get(handle_metrics))
            .with_state(MetricsState {
                gateway: self.gateway.clone(),
                registry: self.registry.clone(),
            })
    }

    /// Bind the configured listeners and serve them in the background
    pub async fn bind(self) -> Result<RunningGateway, GatewayError> {
        let config = self.gateway.config();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let listener = TcpListener::bind(&config.listen).await?;
        let addr = listener.local_addr()?;
        info!("Gateway listening on {}", addr);
        tasks.push(serve(listener, self.router(), shutdown.clone()));

        let metrics_addr = match &config.metrics_listen {
            Some(metrics_listen) => {
                let listener = TcpListener::bind(metrics_listen).await?;
                let metrics_addr = listener.local_addr()?;
                info!("Metrics available at http://{}/metrics", metrics_addr);
                tasks.push(serve(listener, self.metrics_router(), shutdown.clone()));
                Some(metrics_addr)
            }
            None => None,
        };

        Ok(RunningGateway {
            addr,
            metrics_addr,
            gateway: self.gateway,
            shutdown,
            tasks,
        })
    }
}

fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("Server error: {}", e);
        }
    })
}

async fn handle_metrics(State(state): State<MetricsState>) -> Response {
    state.gateway.metrics().observe_pool(state.gateway.pool());
    match state.registry.encode() {
        Ok(text) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// A gateway serving its listeners
pub struct RunningGateway {
    addr: SocketAddr,
    metrics_addr: Option<SocketAddr>,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop accepting connections and tear all sessions down
    pub async fn shutdown(self) {
        info!("Gateway shutting down");
        self.shutdown.cancel();
        self.gateway.sessions().close_all("gateway shutdown");
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
