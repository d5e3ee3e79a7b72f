//! Stream forwarders - bridge accepted streams to the local server
//!
//! One forwarder task runs per accepted stream. HTTP forwarding parses a
//! single request off the stream, replays it against the local target
//! through a pooled client, and writes the response back; TCP forwarding
//! is a plain bidirectional byte copy.

use crate::protocol::Stream;
use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{Client, Method, StatusCode};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// How long a dial to the local server may take.
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle connections kept per local target.
const MAX_IDLE_PER_HOST: usize = 100;

/// How long an idle local connection is retained.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Buffer for response writes, so headers and the start of the body
/// coalesce into few large DATA frames instead of many small ones.
const RESPONSE_BUFFER: usize = 64 * 1024;

/// Synthesized response when the local server cannot be reached.
const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: application/json\r\nContent-Length: 0\r\n\r\n";

/// Clients pooled by target address so local TCP connections are reused
/// across requests instead of re-dialed per asset.
static CLIENT_POOL: Lazy<Mutex<HashMap<String, Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn pooled_client(target: &str) -> Result<Client, reqwest::Error> {
    let mut pool = CLIENT_POOL.lock().unwrap();
    if let Some(client) = pool.get(target) {
        return Ok(client.clone());
    }
    let client = Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .connect_timeout(LOCAL_DIAL_TIMEOUT)
        .build()?;
    pool.insert(target.to_string(), client.clone());
    Ok(client)
}

/// One HTTP request parsed off a stream.
#[derive(Debug)]
struct ParsedRequest {
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Response from the local server, buffered for write-back.
struct LocalResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Forward one HTTP request: parse it off the stream, replay it against
/// `host:port`, and write the response back. Local failure synthesizes a
/// 502. With `inspect` set, logs `METHOD PATH STATUS DURATION`.
pub async fn forward_http(mut stream: Stream, local_host: String, local_port: u16, inspect: bool) {
    let target = format!("{local_host}:{local_port}");

    let request = {
        let mut reader = BufReader::new(&mut stream);
        match read_request(&mut reader).await {
            Ok(request) => request,
            Err(e) => {
                debug!("error reading request from stream: {e}");
                stream.close().await;
                return;
            }
        }
    };

    let method = request.method.clone();
    let path = request.path.clone();
    let start = Instant::now();

    match send_local_request(&target, request).await {
        Ok(response) => {
            let status = response.status;
            if let Err(e) = write_response(&mut stream, response).await {
                debug!("error writing response to stream: {e}");
            }
            if inspect {
                warn!(
                    "{} {} {} {}ms",
                    method,
                    path,
                    status.as_u16(),
                    start.elapsed().as_millis()
                );
            }
        }
        Err(e) => {
            warn!("connection to {target} refused, is your application running?");
            debug!("local request failed: {e}");
            let _ = stream.write_all(BAD_GATEWAY_RESPONSE).await;
        }
    }

    stream.close().await;
}

/// Forward raw TCP: copy bytes in both directions between the stream and
/// a fresh connection to `host:port` until either side finishes.
pub async fn forward_tcp(mut stream: Stream, local_host: String, local_port: u16) {
    let target = format!("{local_host}:{local_port}");

    let mut conn = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&target)).await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            warn!("connection to {target} refused, is your application running?");
            debug!("dial error: {e}");
            stream.close().await;
            return;
        }
        Err(_) => {
            warn!("connection to {target} refused, is your application running?");
            stream.close().await;
            return;
        }
    };

    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    let (mut conn_rd, mut conn_wr) = conn.split();

    // Either direction finishing cancels the other; both endpoints are
    // closed on the way out.
    tokio::select! {
        _ = tokio::io::copy(&mut stream_rd, &mut conn_wr) => {}
        _ = tokio::io::copy(&mut conn_rd, &mut stream_wr) => {}
    }

    let mut stream = stream_rd.unsplit(stream_wr);
    let _ = stream.shutdown().await;
}

/// Read one HTTP/1.1 request: request line, headers, then a body sized by
/// Content-Length.
async fn read_request<R>(reader: &mut R) -> io::Result<ParsedRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before request line",
        ));
    }

    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(_version)) => (method, path),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request line: {}", request_line.trim()),
            ))
        }
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid request method"))?;
    let path = path.to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid content-length")
                })?;
            }
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(ParsedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Replay a parsed request against the local target via the pooled client.
async fn send_local_request(
    target: &str,
    request: ParsedRequest,
) -> Result<LocalResponse, reqwest::Error> {
    let client = pooled_client(target)?;
    let url = format!("http://{target}{}", request.path);

    let mut builder = client.request(request.method, url);
    for (name, value) in &request.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body);
    }

    let response = builder.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    Ok(LocalResponse {
        status,
        headers,
        body,
    })
}

/// Write the response back: status line, headers, body, through one
/// buffered writer so the bytes land in few large frames.
async fn write_response(stream: &mut Stream, response: LocalResponse) -> io::Result<()> {
    let mut writer = BufWriter::with_capacity(RESPONSE_BUFFER, stream);

    let reason = response.status.canonical_reason().unwrap_or("");
    writer
        .write_all(format!("HTTP/1.1 {} {}\r\n", response.status.as_u16(), reason).as_bytes())
        .await?;

    for (name, value) in response.headers.iter() {
        if skip_response_header(name) {
            continue;
        }
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }

    // The body is buffered and decoded, so re-frame it with an explicit
    // length regardless of how the local server transferred it.
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", response.body.len()).as_bytes())
        .await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}

/// Headers that describe the connection rather than the request, plus
/// Content-Length which is re-derived from the replayed body.
fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("content-length")
}

fn skip_response_header(name: &HeaderName) -> bool {
    *name == reqwest::header::TRANSFER_ENCODING
        || *name == reqwest::header::CONTENT_LENGTH
        || *name == reqwest::header::CONNECTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_with_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: example.dev\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(&raw[..]);

        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/submit");
        assert_eq!(request.body, b"hello");
        assert!(request
            .headers
            .iter()
            .any(|(n, v)| n == "Host" && v == "example.dev"));
    }

    #[tokio::test]
    async fn test_read_request_no_body() {
        let raw = b"GET /assets/app.js HTTP/1.1\r\nAccept: */*\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);

        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/assets/app.js");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_read_request_invalid_line() {
        let raw = b"garbage\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);

        let err = read_request(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_pooled_client_reuse() {
        let a = pooled_client("127.0.0.1:4000").unwrap();
        let b = pooled_client("127.0.0.1:4000").unwrap();
        // Same pool entry: reqwest clients share their connection pool
        // through cheap clones.
        drop((a, b));
        assert!(CLIENT_POOL.lock().unwrap().contains_key("127.0.0.1:4000"));
    }

    #[test]
    fn test_hop_by_hop_filter() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Content-Length"));
        assert!(!is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("Accept"));
    }
}
