//! POS server API client.
//!
//! `RemoteApi` is the boundary the rest of the core talks to; `HttpRemote`
//! is the reqwest implementation used in production. Every GET that must
//! bypass intermediary caches (`/health`, `/pos/sync`) carries a `t=`
//! cache-buster.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::mirror::Snapshot;

pub const HEALTH_PATH: &str = "/health";
pub const SNAPSHOT_PATH: &str = "/pos/sync";
pub const TICKETS_PATH: &str = "/tickets";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the server base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Append a `t=<millis>` query parameter so proxies and service workers
/// never answer from cache.
pub fn cache_busted(path: &str) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{path}{sep}t={}", chrono::Utc::now().timestamp_millis())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> CoreError {
    let message = if err.is_connect() {
        format!("Cannot reach POS server at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid POS server URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    CoreError::Http(message)
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "POS server endpoint not found".to_string(),
        s if s >= 500 => "POS server error".to_string(),
        _ => "Unexpected response from POS server".to_string(),
    }
}

/// Build a `Status` error, preferring the server's own `error`/`message`.
fn status_error(status: StatusCode, body_text: &str) -> CoreError {
    let server_message = serde_json::from_str::<Value>(body_text).ok().and_then(|json| {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    CoreError::Status {
        status: status.as_u16(),
        message: server_message.unwrap_or_else(|| status_message(status)),
    }
}

/// Pull the snapshot out of a `/pos/sync` response. Accepts the bare shape
/// and the `{ data: { ... } }` wrapper.
pub fn parse_snapshot(resp: Value) -> CoreResult<Snapshot> {
    let has_sections = |v: &Value| {
        ["categories", "products", "services", "customers", "employees", "inventory"]
            .iter()
            .any(|k| v.get(*k).is_some())
    };

    let body = match resp {
        Value::Object(_) if has_sections(&resp) => resp,
        Value::Object(mut map) => match map.remove("data") {
            Some(inner) if has_sections(&inner) => inner,
            _ => {
                return Err(CoreError::InvalidResponse(
                    "sync payload is missing all collection sections".into(),
                ))
            }
        },
        _ => return Err(CoreError::InvalidResponse("sync payload is not an object".into())),
    };

    serde_json::from_value(body).map_err(|e| CoreError::InvalidResponse(format!("sync payload: {e}")))
}

// ---------------------------------------------------------------------------
// Remote boundary
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Lightweight reachability check. `Ok` means a 2xx came back.
    async fn health(&self) -> CoreResult<()>;

    /// Full dataset for the mirror.
    async fn fetch_snapshot(&self) -> CoreResult<Snapshot>;

    /// Generic JSON request. `path` includes the leading slash. Empty or
    /// 204 bodies come back as `Value::Null`.
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> CoreResult<Value>;
}

/// reqwest-backed `RemoteApi`.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    probe_timeout: Duration,
}

impl HttpRemote {
    pub fn new(config: &CoreConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CoreError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.server_url),
            api_key: config.api_key.clone(),
            probe_timeout: config.probe_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("X-POS-API-Key", key);
        }
        req
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn health(&self) -> CoreResult<()> {
        let resp = self
            .request(Method::GET, &cache_busted(HEALTH_PATH))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, ""))
        }
    }

    async fn fetch_snapshot(&self) -> CoreResult<Snapshot> {
        let resp = self.send(Method::GET, &cache_busted(SNAPSHOT_PATH), None).await?;
        parse_snapshot(resp)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> CoreResult<Value> {
        trace!(%method, path, "api request");
        let mut req = self.request(method.clone(), path);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            debug!(%method, path, status = status.as_u16(), "api request rejected");
            return Err(status_error(status, &body_text));
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| CoreError::InvalidResponse(format!("Invalid JSON from POS server: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    fn content_length(head: &str) -> usize {
        head.lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().ok())
                    .flatten()
            })
            .unwrap_or(0)
    }

    /// One-shot HTTP server: accepts a single connection, captures the raw
    /// request, replies with `response` verbatim.
    pub(crate) async fn serve_once(
        response: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = find_header_end(&buf) {
                    let head = String::from_utf8_lossy(&buf[..end]).to_string();
                    if buf.len() >= end + content_length(&head) {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn remote_for(base: &str) -> HttpRemote {
        let config = CoreConfig {
            server_url: base.to_string(),
            api_key: Some("key-123".into()),
            probe_timeout_secs: 1,
            request_timeout_secs: 2,
            ..Default::default()
        };
        HttpRemote::new(&config).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("pos.example.com/"), "https://pos.example.com");
        assert_eq!(normalize_base_url(" localhost:3000//"), "http://localhost:3000");
        assert_eq!(normalize_base_url("http://10.0.0.5/api"), "http://10.0.0.5/api");
    }

    #[test]
    fn test_cache_busted_appends_query() {
        assert!(cache_busted("/health").starts_with("/health?t="));
        assert!(cache_busted("/pos/sync?full=1").starts_with("/pos/sync?full=1&t="));
    }

    #[test]
    fn test_parse_snapshot_bare_and_wrapped() {
        let bare = json!({
            "categories": [{ "id": "c1" }],
            "inventory": { "p1": 3 },
            "timestamp": "2026-10-01T00:00:00Z"
        });
        let snap = parse_snapshot(bare).unwrap();
        assert_eq!(snap.categories.len(), 1);
        assert!(snap.products.is_empty());
        assert_eq!(snap.inventory.get("p1"), Some(&json!(3)));

        let wrapped = json!({ "success": true, "data": { "products": [{ "_id": "p1" }] } });
        assert_eq!(parse_snapshot(wrapped).unwrap().products.len(), 1);

        assert!(parse_snapshot(json!({ "success": true })).is_err());
        assert!(parse_snapshot(json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_send_posts_json_with_api_key() {
        let (base, server) = serve_once(
            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 22\r\nConnection: close\r\n\r\n{\"id\":\"p-1\",\"ok\":true}",
        )
        .await;
        let remote = remote_for(&base);

        let resp = remote
            .send(Method::POST, "/products", Some(json!({ "name": "Soap" })))
            .await
            .unwrap();
        assert_eq!(resp["id"], "p-1");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /products HTTP/1.1"));
        assert!(request.to_lowercase().contains("x-pos-api-key: key-123"));
        assert!(request.contains("\"name\":\"Soap\""));
    }

    #[tokio::test]
    async fn test_send_maps_server_error_body() {
        let (base, _server) = serve_once(
            "HTTP/1.1 422 Unprocessable Entity\r\nContent-Type: application/json\r\nContent-Length: 23\r\nConnection: close\r\n\r\n{\"error\":\"bad payload\"}",
        )
        .await;
        let err = remote_for(&base)
            .send(Method::PUT, "/products/p1", Some(json!({})))
            .await
            .unwrap_err();
        match err {
            CoreError::Status { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad payload");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_empty_body_is_null() {
        let (base, _server) =
            serve_once("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let resp = remote_for(&base)
            .send(Method::DELETE, "/products/p1", None)
            .await
            .unwrap();
        assert_eq!(resp, Value::Null);
    }

    #[tokio::test]
    async fn test_health_uses_cache_buster() {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        remote_for(&base).health().await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /health?t="));
    }

    #[tokio::test]
    async fn test_health_non_2xx_is_error() {
        let (base, _server) =
            serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        let err = remote_for(&base).health().await.unwrap_err();
        assert!(matches!(err, CoreError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_http_error() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = remote_for(&format!("http://{addr}")).health().await.unwrap_err();
        assert!(matches!(err, CoreError::Http(_)));
        assert!(err.is_remote());
    }
}
