//! Proxy server implementation
//!
//! Plain HTTP/1.1 forward proxy that hands every request to a [`Fetch`]
//! handler (normally the GraphQL interceptor) and writes its answer back.
//! `CONNECT` tunnels are relayed byte-for-byte without inspection.

use crate::interceptor::Fetch;
use crate::models::{FetchRequest, FetchResponse, HttpMethod};
use anyhow::anyhow;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024; // 32MB hard cap on inbound bodies

/// Keep-alive idle timeout in seconds
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct RequestBodyTooLarge {
    limit: usize,
}

impl RequestBodyTooLarge {
    fn new(limit: usize) -> Self {
        Self { limit }
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address (e.g., "127.0.0.1")
    pub bind_address: String,
    /// Directory for the rule database and release-build logs
    pub storage_path: String,
    /// Tab id the proxied traffic is attributed to
    pub tab_id: u32,
    /// How long a request waits for the current rules before passing through
    pub bridge_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            bind_address: "127.0.0.1".to_string(),
            storage_path: default_storage_path(),
            tab_id: 1,
            bridge_timeout_ms: 250,
        }
    }
}

fn default_storage_path() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("graphqlens"))
        .unwrap_or_else(|| std::path::PathBuf::from("./graphqlens"))
        .to_string_lossy()
        .to_string()
}

/// Run the proxy server until `running` is cleared.
pub async fn run_server(
    config: &ProxyConfig,
    handler: Arc<dyn Fetch>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Proxy server listening on {}", addr);

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        // Use accept with timeout so we can check cancellation periodically
        let accept_result =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), listener.accept()).await;

        match accept_result {
            Ok(Ok((socket, peer_addr))) => {
                tracing::debug!("Connection from {}", peer_addr);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, handler).await {
                        let err_str = e.to_string().to_lowercase();
                        if err_str.contains("eof")
                            || err_str.contains("broken pipe")
                            || err_str.contains("connection reset")
                            || err_str.contains("connection closed")
                        {
                            tracing::debug!("Connection closed by client: {}", e);
                        } else {
                            tracing::error!("Error handling connection: {}", e);
                        }
                    }
                });
            }
            Ok(Err(e)) => tracing::error!("Accept error: {}", e),
            Err(_) => continue,
        }
    }

    tracing::info!("Proxy server stopped");
    Ok(())
}

/// Determine if connection should be kept alive based on HTTP version and headers
fn should_keep_alive(version: &str, headers: &[(String, String)]) -> bool {
    match header_value(headers, "connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version.contains("1.1"), // HTTP/1.1 defaults to keep-alive
    }
}

/// Serve one client connection, answering requests until it closes, goes
/// idle, or asks to close.
pub async fn handle_connection<S>(mut socket: S, handler: Arc<dyn Fetch>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request_number: u32 = 0;
    // Bytes read past the end of the previous request (pipelining).
    let mut pending = Vec::new();

    loop {
        request_number += 1;

        let mut head = match tokio::time::timeout(
            tokio::time::Duration::from_secs(KEEP_ALIVE_TIMEOUT_SECS),
            read_request_head(&mut socket, std::mem::take(&mut pending)),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(err)) => {
                if err.downcast_ref::<RequestBodyTooLarge>().is_some() {
                    let _ = respond_with_status(&mut socket, 413, "Payload Too Large", &err.to_string()).await;
                } else if request_number == 1 {
                    // Later failures are normally the client closing an idle connection.
                    tracing::warn!("Failed to parse request: {err}");
                    let _ = respond_with_status(
                        &mut socket,
                        400,
                        "Bad Request",
                        "Unable to parse HTTP request",
                    )
                    .await;
                }
                break;
            }
            Err(_) => {
                tracing::debug!("Keep-alive timeout after {} requests", request_number - 1);
                break;
            }
        };

        if head.method == HttpMethod::Connect {
            return handle_connect_tunnel(socket, head).await;
        }

        let keep_alive = should_keep_alive(&head.version, &head.headers);
        let buffered = std::mem::take(&mut head.buffered_body);
        let body = match read_request_body(&mut socket, head.body_kind, buffered).await {
            Ok((body, leftover)) => {
                pending = leftover;
                body
            }
            Err(err) if err.downcast_ref::<RequestBodyTooLarge>().is_some() => {
                respond_with_status(&mut socket, 413, "Payload Too Large", &err.to_string()).await?;
                break;
            }
            Err(err) => return Err(err),
        };

        let request = head.into_fetch_request(body);
        tracing::debug!(method = %request.method, url = %request.url, "proxying request");
        let response = match handler.fetch(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("Upstream request failed: {err:#}");
                FetchResponse::new(502, format!("Upstream request failed: {err}"))
            }
        };

        write_response(&mut socket, &response, keep_alive).await?;

        if !keep_alive {
            break;
        }
    }

    Ok(())
}

/// Request line and headers, plus any body bytes that arrived with them.
#[derive(Debug)]
struct RequestHead {
    method: HttpMethod,
    url: String,
    /// `host:port` for CONNECT
    authority: String,
    version: String,
    headers: Vec<(String, String)>,
    body_kind: RequestBodyKind,
    buffered_body: Vec<u8>,
}

impl RequestHead {
    fn into_fetch_request(self, body: Vec<u8>) -> FetchRequest {
        FetchRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: if body.is_empty() {
                None
            } else {
                Some(Bytes::from(body))
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestBodyKind {
    None,
    ContentLength { length: usize },
    Chunked,
}

async fn read_request_head<S>(stream: &mut S, pending: Vec<u8>) -> anyhow::Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered_body) = read_message_head(stream, pending).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method_str = req.method.unwrap_or("GET");
    let target = req.path.unwrap_or("/");
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = headers_from_httparse(req.headers);

    let content_length =
        header_value(&headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok());
    if let Some(len) = content_length {
        if len > MAX_REQUEST_BODY_BYTES {
            return Err(RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES).into());
        }
    }
    let is_chunked = header_value(&headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let method = HttpMethod::from_str_lossy(method_str);
    if method == HttpMethod::Connect {
        let (host, port) = split_host_and_port(target, 443);
        return Ok(RequestHead {
            method,
            url: String::new(),
            authority: format!("{host}:{port}"),
            version,
            headers,
            body_kind: RequestBodyKind::None,
            buffered_body,
        });
    }

    let url = resolve_target(target, &headers)?;
    let body_kind = if is_chunked {
        RequestBodyKind::Chunked
    } else if let Some(length) = content_length {
        RequestBodyKind::ContentLength { length }
    } else {
        RequestBodyKind::None
    };

    Ok(RequestHead {
        method,
        url,
        authority: String::new(),
        version,
        headers,
        body_kind,
        buffered_body,
    })
}

/// Read the body that follows a head. Returns the body and whatever bytes of
/// the next request were already buffered.
async fn read_request_body<S>(
    stream: &mut S,
    kind: RequestBodyKind,
    mut buffered: Vec<u8>,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    match kind {
        RequestBodyKind::None => Ok((Vec::new(), buffered)),
        RequestBodyKind::ContentLength { length } => {
            if buffered.len() >= length {
                let leftover = buffered.split_off(length);
                return Ok((buffered, leftover));
            }
            let rest = read_exact_body(stream, length - buffered.len()).await?;
            buffered.extend_from_slice(&rest);
            Ok((buffered, Vec::new()))
        }
        RequestBodyKind::Chunked => {
            decode_chunked_body(buffered, stream, MAX_REQUEST_BODY_BYTES).await
        }
    }
}

async fn handle_connect_tunnel<S>(mut client: S, head: RequestHead) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match TcpStream::connect(&head.authority).await {
        Ok(mut upstream) => {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            if !head.buffered_body.is_empty() {
                upstream.write_all(&head.buffered_body).await?;
            }
            tracing::debug!(authority = %head.authority, "tunnel established");
            tunnel(&mut client, &mut upstream).await
        }
        Err(e) => {
            tracing::error!("Failed to establish CONNECT tunnel to {} - {}", head.authority, e);
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await?;
            Ok(())
        }
    }
}

/// Tunnel data between client and upstream server
async fn tunnel<C, U>(client: &mut C, upstream: &mut U) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(client, upstream).await {
        Ok((up, down)) => tracing::debug!(up, down, "tunnel closed"),
        Err(e) => tracing::debug!("Tunnel error: {}", e),
    }
    Ok(())
}

async fn write_response<W>(
    stream: &mut W,
    response: &FetchResponse,
    keep_alive: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, response.status_text);
    for (name, value) in &response.headers {
        if is_framing_header(name) {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    Ok(())
}

/// Headers we always recompute when writing a buffered response.
fn is_framing_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection", "keep-alive"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

async fn read_message_head<S>(
    stream: &mut S,
    mut buffer: Vec<u8>,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];

    loop {
        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }

        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);
    }

    Err(anyhow!("connection closed before headers completed"))
}

async fn read_exact_body<S>(stream: &mut S, expected_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::with_capacity(expected_len.min(64 * 1024));
    let mut remaining = expected_len;

    while remaining > 0 {
        let mut chunk = vec![0u8; remaining.min(8192)];
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(anyhow!("connection closed while reading request body"));
        }
        body.extend_from_slice(&chunk[..read]);
        remaining -= read;
    }

    Ok(body)
}

/// Decode a chunked body into its payload bytes, failing once it grows past
/// `limit`. Bytes read beyond the final chunk are returned alongside.
async fn decode_chunked_body<R>(
    initial_buffer: Vec<u8>,
    stream: &mut R,
    limit: usize,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer: VecDeque<u8> = initial_buffer.into();
    let mut decoded = Vec::new();

    loop {
        let line = read_crlf_line(&mut buffer, stream).await?;
        if line.len() < 2 {
            return Err(anyhow!("invalid chunked encoding: missing CRLF"));
        }

        let header_bytes = &line[..line.len() - 2];
        let size_token = std::str::from_utf8(header_bytes)
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let chunk_size = usize::from_str_radix(size_token, 16)
            .map_err(|_| anyhow!("invalid chunk size: {size_token}"))?;

        if chunk_size == 0 {
            // Trailers end with blank line
            loop {
                let trailer_line = read_crlf_line(&mut buffer, stream).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        if decoded.len() + chunk_size > limit {
            return Err(RequestBodyTooLarge::new(limit).into());
        }
        let chunk_data = read_exact_from_buffer(&mut buffer, stream, chunk_size).await?;
        decoded.extend_from_slice(&chunk_data);

        let crlf = read_exact_from_buffer(&mut buffer, stream, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
    }

    Ok((decoded, buffer.into()))
}

async fn read_crlf_line<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf_in_deque(buffer) {
            return Ok(buffer.drain(..pos + 2).collect());
        }
        fill_buffer(buffer, stream).await?;
    }
}

async fn read_exact_from_buffer<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    len: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < len {
        fill_buffer(buffer, stream).await?;
    }
    Ok(buffer.drain(..len).collect())
}

async fn fill_buffer<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let read = stream.read(&mut temp).await?;
    if read == 0 {
        return Err(anyhow!("connection closed while reading chunked body"));
    }
    buffer.extend(&temp[..read]);
    Ok(())
}

fn find_crlf_in_deque(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            let name = h.name.to_string();
            let value = String::from_utf8_lossy(h.value).to_string();
            (name, value)
        })
        .collect()
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Absolute URL for a request target. Absolute-form targets are used as
/// sent; origin-form targets are resolved against the `Host` header.
fn resolve_target(raw_path: &str, headers: &[(String, String)]) -> anyhow::Result<String> {
    let lower = raw_path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(raw_path.to_string());
    }

    let host_header = header_value(headers, "host")
        .ok_or_else(|| anyhow!("Missing Host header in HTTP/1.1 request"))?;
    let (host, port) = split_host_and_port(host_header.trim(), 80);
    let authority = if port == 80 {
        host
    } else {
        format!("{host}:{port}")
    };
    let path = if raw_path.starts_with('/') {
        raw_path.to_string()
    } else {
        format!("/{raw_path}")
    };
    Ok(format!("http://{authority}{path}"))
}

fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), parsed);
        }
    }
    (input.to_string(), default_port)
}

async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body_bytes.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
