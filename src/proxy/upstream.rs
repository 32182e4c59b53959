//! Upstream forwarding
//!
//! The real network call behind the interceptor. Requests that no rule
//! answers are replayed against their origin with reqwest and the buffered
//! response is handed back unchanged.

use crate::interceptor::Fetch;
use crate::models::{canonical_reason, FetchRequest, FetchResponse, HttpMethod};
use anyhow::Context;
use futures::future::BoxFuture;
use std::time::Instant;

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

pub struct UpstreamFetch {
    client: reqwest::Client,
}

impl UpstreamFetch {
    pub fn new() -> anyhow::Result<Self> {
        // Env/system proxies would loop traffic back through us.
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn forward(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        let started = Instant::now();
        let method = reqwest_method(&request.method)?;
        let mut builder = self.client.request(method, &request.url);

        for (key, value) in request.headers.iter().filter(|(k, _)| !is_hop_by_hop(k)) {
            if let Ok(header_name) = reqwest::header::HeaderName::try_from(key.as_str()) {
                if let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) {
                    builder = builder.header(header_name, header_value);
                }
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {}", request.method, request.url))?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .context("Failed to read upstream response body")?;

        tracing::debug!(
            url = %request.url,
            status,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream response"
        );

        Ok(FetchResponse {
            status,
            status_text: canonical_reason(status).to_string(),
            headers,
            body,
            mocked: false,
        })
    }
}

impl Fetch for UpstreamFetch {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, anyhow::Result<FetchResponse>> {
        Box::pin(self.forward(request))
    }
}

fn reqwest_method(method: &HttpMethod) -> anyhow::Result<reqwest::Method> {
    Ok(match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Connect => reqwest::Method::CONNECT,
        HttpMethod::Trace => reqwest::Method::TRACE,
        HttpMethod::Other(token) => reqwest::Method::from_bytes(token.as_bytes())
            .with_context(|| format!("invalid method token {token:?}"))?,
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn hop_by_hop_headers_are_recognised() {
        assert!(is_hop_by_hop("Host"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("proxy-connection"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn extension_methods_map_to_their_token() {
        let propfind = reqwest_method(&HttpMethod::Other("PROPFIND".into())).unwrap();
        assert_eq!(propfind.as_str(), "PROPFIND");
        assert_eq!(reqwest_method(&HttpMethod::Put).unwrap(), reqwest::Method::PUT);
        assert!(reqwest_method(&HttpMethod::Other("BAD METHOD".into())).is_err());
    }

    #[tokio::test]
    async fn forwards_request_and_buffers_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !String::from_utf8_lossy(&seen).contains("{\"q\":1}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}",
                )
                .await
                .unwrap();
            String::from_utf8_lossy(&seen).to_string()
        });

        let upstream = UpstreamFetch::new().unwrap();
        let request = FetchRequest::post(format!("http://{addr}/graphql"), "{\"q\":1}")
            .with_header("Content-Type", "application/json")
            .with_header("Proxy-Connection", "keep-alive");
        let response = upstream.fetch(request).await.unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.status_text, "Created");
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert!(response.header("connection").is_none());
        assert_eq!(&response.body[..], b"{\"ok\":true}");
        assert!(!response.mocked);

        let raw = origin.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("post /graphql http/1.1"));
        assert!(raw.contains("content-type: application/json"));
        assert!(!raw.contains("proxy-connection"));
    }

    #[tokio::test]
    async fn unreachable_origin_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = UpstreamFetch::new().unwrap();
        let err = upstream
            .fetch(FetchRequest::new(HttpMethod::Get, format!("http://{addr}/")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GET http://"));
    }
}
