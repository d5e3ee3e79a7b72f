//! Forwarder tests: accepted streams bridged to throwaway local servers.
//!
//! The "relay side" is played by a server-role mux that opens streams
//! toward the agent, exactly as the real relay does for each visitor.

use skyhook::protocol::{Mux, Role};
use skyhook::tunnel::{forward_http, forward_tcp};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Connected (server, client) mux pair over a loopback WebSocket.
async fn mux_pair() -> (Mux, Mux) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        Mux::new(ws, Role::Server)
    });

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let client = Mux::new(ws, Role::Client);
    let server = server.await.unwrap();

    (server, client)
}

/// Minimal local HTTP server: answers every request with a fixed body.
async fn spawn_local_http() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    match conn.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => read += n,
                    }
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = conn
                    .write_all(
                        b"HTTP/1.1 200 OK\r\n\
                          Content-Type: text/plain\r\n\
                          Content-Length: 12\r\n\r\n\
                          hello world!",
                    )
                    .await;
            });
        }
    });

    port
}

#[tokio::test]
async fn test_http_forwarding_roundtrip() {
    let port = spawn_local_http().await;
    let (relay, agent) = mux_pair().await;

    let mut visitor = relay.open_stream().await.unwrap();
    let stream = agent.accept_stream().await.unwrap();
    tokio::spawn(forward_http(stream, "127.0.0.1".to_string(), port, false));

    visitor
        .write_all(b"GET /hello HTTP/1.1\r\nHost: app.example.dev\r\n\r\n")
        .await
        .unwrap();

    // The forwarder answers exactly one request and closes the stream.
    let mut response = Vec::new();
    visitor.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.to_ascii_lowercase().contains("content-type: text/plain"));
    assert!(text.to_ascii_lowercase().contains("content-length: 12"));
    assert!(text.ends_with("hello world!"));

    relay.close().await;
    agent.close().await;
}

#[tokio::test]
async fn test_http_forwarding_post_body() {
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();

    // Echo the request body back so the round trip is observable.
    tokio::spawn(async move {
        let (mut conn, _) = local.accept().await.unwrap();
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let body = loop {
            let n = conn.read(&mut buf).await.unwrap();
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let header = String::from_utf8_lossy(&data[..pos]).to_string();
                let length: usize = header
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut body = data[pos + 4..].to_vec();
                while body.len() < length {
                    let n = conn.read(&mut buf).await.unwrap();
                    body.extend_from_slice(&buf[..n]);
                }
                break body;
            }
        };
        let _ = conn
            .write_all(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    String::from_utf8_lossy(&body)
                )
                .as_bytes(),
            )
            .await;
    });

    let (relay, agent) = mux_pair().await;
    let mut visitor = relay.open_stream().await.unwrap();
    let stream = agent.accept_stream().await.unwrap();
    tokio::spawn(forward_http(stream, "127.0.0.1".to_string(), port, false));

    visitor
        .write_all(
            b"POST /submit HTTP/1.1\r\nHost: app.example.dev\r\nContent-Length: 9\r\n\r\npayload-1",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    visitor.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("payload-1"));

    relay.close().await;
    agent.close().await;
}

#[tokio::test]
async fn test_http_forwarding_local_refused() {
    let (relay, agent) = mux_pair().await;

    let mut visitor = relay.open_stream().await.unwrap();
    let stream = agent.accept_stream().await.unwrap();
    // Nothing listens on port 1: the dial is refused and a 502 comes back.
    tokio::spawn(forward_http(stream, "127.0.0.1".to_string(), 1, false));

    visitor
        .write_all(b"GET / HTTP/1.1\r\nHost: app.example.dev\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    visitor.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {text}");
    assert!(text.contains("Content-Type: application/json"));
    assert!(text.ends_with("\r\n\r\n"));

    relay.close().await;
    agent.close().await;
}

#[tokio::test]
async fn test_tcp_forwarding_echo() {
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut conn, _) = local.accept().await.unwrap();
        let mut buf = [0u8; 256];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if conn.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let (relay, agent) = mux_pair().await;
    let mut visitor = relay.open_stream().await.unwrap();
    let stream = agent.accept_stream().await.unwrap();
    tokio::spawn(forward_tcp(stream, "127.0.0.1".to_string(), port));

    visitor.write_all(b"echo me").await.unwrap();
    let mut buf = [0u8; 7];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"echo me");

    // Second exchange over the same stream.
    visitor.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    visitor.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again");

    relay.close().await;
    agent.close().await;
}

#[tokio::test]
async fn test_tcp_forwarding_local_refused() {
    let (relay, agent) = mux_pair().await;

    let mut visitor = relay.open_stream().await.unwrap();
    let stream = agent.accept_stream().await.unwrap();
    tokio::spawn(forward_tcp(stream, "127.0.0.1".to_string(), 1));

    // The forwarder cannot reach the local server and closes the stream.
    let mut response = Vec::new();
    visitor.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());

    relay.close().await;
    agent.close().await;
}
