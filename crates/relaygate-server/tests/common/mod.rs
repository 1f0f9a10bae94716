//! Shared fixtures for gateway integration tests

#![allow(dead_code)]

use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use relaygate_server::{GatewayConfig, GatewayServer, MetricsRegistry, RunningGateway};
use relaygate_http_auth::HttpAuthenticator;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const QUOTE: &str = "You never change things by fighting the existing reality. To change something, build a new model that makes the existing model obsolete.";

/// HTTP backend answering every request with a fixed body
pub async fn string_backend(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            body
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

/// TCP backend echoing every connection back to itself
pub async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Which way a [`flaky_proxy`] cut is counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cut {
    /// After this many bytes towards the gateway
    Upstream(usize),
    /// After this many bytes back to the client
    Downstream(usize),
}

/// TCP forwarder that cuts its n-th connection as `cuts[n]` says; connections
/// past the end of `cuts` pass through untouched
pub async fn flaky_proxy(upstream: SocketAddr, cuts: Vec<Cut>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let cut = cuts.get(index).copied();
            tokio::spawn(async move {
                let Ok(mut server) = TcpStream::connect(upstream).await else {
                    return;
                };
                let (up_limit, down_limit) = match cut {
                    None => {
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
                        return;
                    }
                    Some(Cut::Upstream(n)) => (Some(n), None),
                    Some(Cut::Downstream(n)) => (None, Some(n)),
                };

                let (mut client_reader, mut client_writer) = client.split();
                let (mut server_reader, mut server_writer) = server.split();
                tokio::select! {
                    _ = forward(&mut client_reader, &mut server_writer, up_limit) => {}
                    _ = forward(&mut server_reader, &mut client_writer, down_limit) => {}
                }
                // Both sockets drop here without any close handshake.
            });
        }
    });
    (addr, connections)
}

/// Copy until end of file, an error, or `limit` bytes
async fn forward<R, W>(reader: &mut R, writer: &mut W, limit: Option<usize>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0;
    while limit.map_or(true, |limit| total < limit) {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            return;
        }
        total += n;
    }
}

/// Bind a gateway on loopback ports
pub async fn start_gateway(
    mut config: GatewayConfig,
    authenticator: Option<HttpAuthenticator>,
    registry: MetricsRegistry,
) -> RunningGateway {
    config.listen = "127.0.0.1:0".to_string();
    GatewayServer::new(config, authenticator, registry)
        .unwrap()
        .bind()
        .await
        .unwrap()
}

/// GET `path` with the given `Host` header
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (http::StatusCode, http::HeaderMap, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);

    let request = http::Request::builder()
        .uri(path)
        .header(http::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

/// In-memory log sink for asserting on emitted log lines
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
