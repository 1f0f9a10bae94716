//! Live sessions by token

use crate::metrics::GatewayMetrics;
use crate::session::{Session, SessionSettings};
use dashmap::DashMap;
use relaygate_connection::BufferPool;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Sessions by id; closed sessions remove themselves
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for a dialed backend under a fresh token
    pub fn create(
        &self,
        identity: String,
        stream: TcpStream,
        pool: BufferPool,
        settings: SessionSettings,
        metrics: GatewayMetrics,
    ) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Session::start(id.clone(), identity, stream, pool, settings, metrics);
        self.sessions.insert(id.clone(), session.clone());

        let sessions = self.sessions.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            sessions.remove(&id);
            debug!("Session {} removed", id);
        });

        session
    }

    /// Look up a live session
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_closed())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tear every session down
    pub fn close_all(&self, reason: &str) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn settings(keepalive: Duration, grace: Duration) -> SessionSettings {
        SessionSettings {
            replay_window: 8,
            receive_window: 4096,
            keepalive_timeout: keepalive,
            grace_period: grace,
        }
    }

    async fn backend_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialed = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (dialed, accepted)
    }

    async fn wait_until_empty(registry: &SessionRegistry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not removed");
    }

    #[tokio::test]
    async fn test_keepalive_expiry_removes_session() {
        let metrics = GatewayMetrics::register(&MetricsRegistry::new().unwrap()).unwrap();
        let registry = SessionRegistry::new();
        let (dialed, mut backend) = backend_pair().await;

        let session = registry.create(
            "carla".to_string(),
            dialed,
            BufferPool::new(64, 16),
            settings(Duration::from_millis(50), Duration::from_secs(60)),
            metrics.clone(),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get(session.id()).is_some());
        assert_eq!(metrics.sessions_active(), 1);

        wait_until_empty(&registry).await;
        assert!(session.is_closed());
        assert!(registry.get(session.id()).is_none());
        assert_eq!(metrics.sessions_active(), 0);

        // The backend sees the connection go away.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), backend.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_grace_period_after_backend_close() {
        let metrics = GatewayMetrics::register(&MetricsRegistry::new().unwrap()).unwrap();
        let registry = SessionRegistry::new();
        let (dialed, backend) = backend_pair().await;

        let session = registry.create(
            "carla".to_string(),
            dialed,
            BufferPool::new(64, 16),
            settings(Duration::from_secs(60), Duration::from_millis(50)),
            metrics,
        );
        drop(backend);

        wait_until_empty(&registry).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_close_all() {
        let metrics = GatewayMetrics::register(&MetricsRegistry::new().unwrap()).unwrap();
        let registry = SessionRegistry::new();
        let mut backends = Vec::new();
        for _ in 0..3 {
            let (dialed, backend) = backend_pair().await;
            backends.push(backend);
            registry.create(
                "carla".to_string(),
                dialed,
                BufferPool::new(64, 16),
                settings(Duration::from_secs(60), Duration::from_secs(60)),
                metrics.clone(),
            );
        }
        assert_eq!(registry.len(), 3);

        registry.close_all("shutdown");
        wait_until_empty(&registry).await;
    }
}
