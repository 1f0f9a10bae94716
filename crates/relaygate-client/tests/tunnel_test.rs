//! Tunnel client against an in-process relay
//!
//! The relay here speaks the wire protocol directly on top of
//! tokio-tungstenite and echoes the tunnel back to the client, so these tests
//! exercise the client handshake, resume and completion paths without the
//! gateway.

use bytes::Bytes;
use futures_util::StreamExt;
use relaygate_client::{BufferPool, ReconnectConfig, Tunnel, TunnelError, TunnelOptions, TunnelState};
use relaygate_connection::relay::{recv_control, reject, send_control};
use relaygate_connection::{FrameSink, FrameSource, Inbound, LinkExit, Outbound, Relay};
use relaygate_proto::{ControlMessage, Frame, FrameType, RejectCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

fn options() -> TunnelOptions {
    TunnelOptions::default().with_reconnect(ReconnectConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: Some(20),
    })
}

async fn bind() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    (listener, url)
}

#[tokio::test]
async fn test_backend_reject_is_terminal() {
    let (listener, url) = bind().await;

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        let hello = recv_control(&mut source).await.unwrap();
        assert_eq!(
            hello,
            ControlMessage::Open {
                host: "127.0.0.1".to_string(),
                port: 9,
                window: 1024 * 1024,
            }
        );
        reject(&mut sink, RejectCode::BackendUnreachable, "connection refused").await;
    });

    let tunnel = Tunnel::open(BufferPool::new(1024, 8), "127.0.0.1", 9, options()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), tunnel.keep_connected(&url))
        .await
        .unwrap();

    match result {
        Err(TunnelError::Rejected { code, .. }) => assert_eq!(code, RejectCode::BackendUnreachable),
        other => panic!("expected reject, got {:?}", other),
    }
    assert_eq!(tunnel.state(), TunnelState::Closed);
    relay.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_relay_retries_until_closed() {
    // Bind and drop so nothing listens on the port.
    let (listener, url) = bind().await;
    drop(listener);

    let tunnel = Tunnel::open(BufferPool::new(1024, 8), "127.0.0.1", 22, options()).unwrap();
    let supervisor = {
        let tunnel = tunnel.clone();
        let url = url.clone();
        tokio::spawn(async move { tunnel.keep_connected(&url).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tunnel.stats().reconnects >= 1);
    tunnel.close();

    let result = tokio::time::timeout(Duration::from_secs(1), supervisor)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

/// Server half of one echoed tunnel
struct EchoSession {
    pool: BufferPool,
    relay: Relay,
}

impl EchoSession {
    fn new() -> Arc<Self> {
        let session = Arc::new(Self {
            pool: BufferPool::new(1024, 64),
            relay: Relay::new(Arc::new(Outbound::new(32, 1024)), Arc::new(Inbound::new(4096))),
        });

        let echo = session.clone();
        tokio::spawn(async move {
            let inbound = echo.relay.inbound();
            let outbound = echo.relay.outbound();
            while let Some(chunk) = inbound.recv().await {
                for piece in chunk.chunks(echo.pool.buffer_size()) {
                    let mut buffer = echo.pool.get().await;
                    buffer.fill_from(piece);
                    if outbound.append(buffer).await.is_err() {
                        return;
                    }
                }
                inbound.consumed(chunk.len());
            }
            outbound.finish();
        });

        session
    }

    /// Serve one physical connection, dropping it once `break_after` bytes
    /// were received
    async fn serve(self: &Arc<Self>, listener: &TcpListener, break_after: Option<u64>) -> LinkExit {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        let inbound = self.relay.inbound();
        let outbound = self.relay.outbound();
        let resume_at = match recv_control(&mut source).await.unwrap() {
            ControlMessage::Open { window, .. } => {
                outbound.set_peer_window(window);
                0
            }
            ControlMessage::Resume {
                session_id,
                ack,
                window,
                ..
            } => {
                assert_eq!(session_id, "echo-1");
                outbound.set_peer_window(window);
                outbound.resume(ack).unwrap()
            }
            other => panic!("unexpected hello {:?}", other),
        };
        let ready = ControlMessage::Ready {
            session_id: "echo-1".to_string(),
            ack: inbound.delivered(),
            pos: outbound.written(),
            window: inbound.window(),
        };
        send_control(&mut sink, &ready).await.unwrap();

        let cancel = CancellationToken::new();
        let breaker = break_after.map(|limit| {
            let cancel = cancel.clone();
            let session = self.clone();
            tokio::spawn(async move {
                while session.relay.inbound().received() < limit {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                cancel.cancel();
            })
        });

        let exit = self
            .relay
            .run(&mut sink, &mut source, resume_at, &cancel)
            .await
            .unwrap();
        if let Some(breaker) = breaker {
            breaker.abort();
        }
        // Dropping both halves drops the TCP connection without a close frame.
        exit
    }
}

#[tokio::test]
async fn test_resume_after_connection_drop() {
    let (listener, url) = bind().await;
    let session = EchoSession::new();

    let relay = tokio::spawn(async move {
        let mut exits = vec![session.serve(&listener, Some(60_000)).await];
        while *exits.last().unwrap() != LinkExit::Completed {
            exits.push(session.serve(&listener, None).await);
        }
        exits
    });

    let tunnel = Tunnel::open(BufferPool::new(1024, 64), "127.0.0.1", 7, options()).unwrap();
    let supervisor = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.keep_connected(&url).await })
    };

    let (mut app_writer, tunnel_reader) = tokio::io::duplex(4096);
    let (tunnel_writer, mut app_reader) = tokio::io::duplex(4096);
    let sender = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.send(tunnel_reader).await })
    };
    let receiver = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.receive(tunnel_writer).await })
    };

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let writer = {
        let data = data.clone();
        tokio::spawn(async move {
            app_writer.write_all(&data).await.unwrap();
            app_writer.shutdown().await.unwrap();
        })
    };

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), app_reader.read_to_end(&mut echoed))
        .await
        .expect("echo did not finish")
        .unwrap();
    writer.await.unwrap();

    assert_eq!(echoed.len(), data.len());
    assert!(echoed == data, "echoed bytes differ");
    assert_eq!(sender.await.unwrap().unwrap(), data.len() as u64);
    assert_eq!(receiver.await.unwrap().unwrap(), data.len() as u64);

    tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let exits = relay.await.unwrap();
    assert_eq!(exits[0], LinkExit::Cancelled);
    assert!(exits.len() >= 2);

    let stats = tunnel.stats();
    assert!(stats.reconnects >= 1);
    assert_eq!(stats.session_id.as_deref(), Some("echo-1"));
    assert_eq!(stats.state, TunnelState::Closed);
}

#[tokio::test]
async fn test_session_closed_after_backend_end_is_clean() {
    let (listener, url) = bind().await;

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        assert!(matches!(
            recv_control(&mut source).await.unwrap(),
            ControlMessage::Open { .. }
        ));
        let ready = ControlMessage::Ready {
            session_id: "short-1".to_string(),
            ack: 0,
            pos: 0,
            window: 4096,
        };
        send_control(&mut sink, &ready).await.unwrap();

        // The backend says goodbye and closes its side.
        let data = Frame::data(0, 0, Bytes::from_static(b"bye\n"));
        sink.send_frame(data.encode().unwrap()).await.unwrap();
        sink.send_frame(Frame::fin(0, 4).encode().unwrap()).await.unwrap();

        loop {
            let raw = source.recv_frame().await.unwrap().expect("client went away");
            let frame = Frame::decode(raw).unwrap();
            if frame.frame_type == FrameType::Ack && frame.flags.has_fin() {
                assert_eq!(frame.ack, 4);
                break;
            }
        }

        // Grace period over while the client still has its input open.
        reject(&mut sink, RejectCode::SessionClosed, "grace period expired").await;
    });

    let tunnel = Tunnel::open(BufferPool::new(1024, 8), "127.0.0.1", 25, options()).unwrap();
    let mut states = tunnel.subscribe();
    let supervisor = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.keep_connected(&url).await })
    };

    states
        .wait_for(|state| *state == TunnelState::Connected)
        .await
        .unwrap();

    let (tunnel_writer, mut app_reader) = tokio::io::duplex(4096);
    let received = tunnel.receive(tunnel_writer).await.unwrap();
    assert_eq!(received, 4);
    let mut text = String::new();
    app_reader.read_to_string(&mut text).await.unwrap();
    assert_eq!(text, "bye\n");

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "expected a clean end, got {:?}", result);
    assert_eq!(*states.borrow_and_update(), TunnelState::Closed);
    relay.await.unwrap();
}
