//! HTTP transport to the upstream API.
//!
//! One attempt per call: no retries, bounded by the connect and total
//! timeouts from [`UpstreamConfig`].
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::ACCEPT_ENCODING;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use crate::config::UpstreamConfig;

/// Headers that describe a single hop and must not be relayed.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Request(String),

    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("malformed probe response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return TransportError::Timeout;
        }
        // The URL carries the secret as a query parameter.
        TransportError::Request(e.without_url().to_string())
    }
}

/// A client request, already stripped of the proxy prefix.
pub struct ProxyRequest {
    pub method: Method,
    /// Path below the proxy prefix, starting with `/`.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Body,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Validity and remaining quota reported by the upstream for one secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub valid: bool,
    pub remaining: i64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Relay `req` upstream with `secret` attached as the auth parameter.
    async fn call(&self, req: ProxyRequest, secret: &str) -> Result<UpstreamResponse, TransportError>;

    /// Ask the upstream how much quota `secret` has left.
    async fn probe(&self, secret: &str) -> Result<ProbeReport, TransportError>;
}

#[derive(Deserialize)]
struct ApiInfo {
    #[serde(default)]
    query_credits: i64,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: RwLock<Url>,
    auth_param: String,
    probe_path: String,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(cfg.timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: RwLock::new(cfg.base_url.clone()),
            auth_param: cfg.auth_param.clone(),
            probe_path: cfg.probe_path.clone(),
        })
    }

    pub async fn base_url(&self) -> Url {
        self.base_url.read().await.clone()
    }

    pub async fn set_base_url(&self, url: Url) {
        tracing::info!(upstream = %url, "upstream base URL changed");
        *self.base_url.write().await = url;
    }
}

#[async_trait]
impl Transport for UpstreamClient {
    async fn call(&self, req: ProxyRequest, secret: &str) -> Result<UpstreamResponse, TransportError> {
        let url = build_url(
            &self.base_url().await,
            &req.path,
            req.query.as_deref(),
            &self.auth_param,
            secret,
        )?;

        let mut headers = req.headers;
        strip_request_headers(&mut headers);

        let body = reqwest::Body::wrap_stream(req.body.into_data_stream());

        let resp = self
            .client
            .request(req.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let err = TransportError::from(e);
                tracing::warn!("upstream request failed: {}", err);
                err
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        Ok(UpstreamResponse {
            status,
            headers,
            body: Body::from_stream(resp.bytes_stream()),
        })
    }

    async fn probe(&self, secret: &str) -> Result<ProbeReport, TransportError> {
        let url = build_url(
            &self.base_url().await,
            &self.probe_path,
            None,
            &self.auth_param,
            secret,
        )?;

        let resp = self.client.get(url).send().await?;
        if resp.status().as_u16() >= 400 {
            return Ok(ProbeReport {
                valid: false,
                remaining: 0,
            });
        }

        let info: ApiInfo = resp
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.without_url().to_string()))?;

        Ok(ProbeReport {
            valid: info.query_credits > 0,
            remaining: info.query_credits.max(0),
        })
    }
}

/// Join `path` onto `base`, keep the client's raw query segments and append
/// `auth_param=<secret>`. A client-supplied `auth_param` is dropped.
pub fn build_url(
    base: &Url,
    path: &str,
    query: Option<&str>,
    auth_param: &str,
    secret: &str,
) -> Result<Url, TransportError> {
    let mut url = base.clone();
    if url.cannot_be_a_base() {
        return Err(TransportError::InvalidUrl(base.to_string()));
    }

    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);

    let mut segments: Vec<String> = query
        .unwrap_or_default()
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter(|kv| kv.split('=').next() != Some(auth_param))
        .map(String::from)
        .collect();
    let encoded: String = url::form_urlencoded::byte_serialize(secret.as_bytes()).collect();
    segments.push(format!("{}={}", auth_param, encoded));
    url.set_query(Some(&segments.join("&")));

    Ok(url)
}

/// Drops `host` and hop-by-hop headers, and pins `accept-encoding` to
/// `identity`: the response scrubber works on raw bytes and cannot see the
/// secret inside a compressed body.
fn strip_request_headers(headers: &mut HeaderMap) {
    headers.remove("host");
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(uri: &str, timeout: Duration) -> UpstreamClient {
        let mut cfg = UpstreamConfig::new(Url::parse(uri).unwrap());
        cfg.timeout = timeout;
        cfg.connect_timeout = Duration::from_millis(500);
        UpstreamClient::new(&cfg).unwrap()
    }

    fn request(method: Method, path: &str, query: Option<&str>, body: &str) -> ProxyRequest {
        ProxyRequest {
            method,
            path: path.to_string(),
            query: query.map(String::from),
            headers: HeaderMap::new(),
            body: Body::from(body.to_string()),
        }
    }

    #[test]
    fn test_build_url_appends_secret() {
        let base = Url::parse("https://api.example.com").unwrap();
        let url = build_url(&base, "/shodan/host/1.1.1.1", Some("minify=true"), "key", "s3cret").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/shodan/host/1.1.1.1?minify=true&key=s3cret"
        );
    }

    #[test]
    fn test_build_url_replaces_client_key_param() {
        let base = Url::parse("https://api.example.com/v2/").unwrap();
        let url = build_url(&base, "/search", Some("key=evil&q=a%20b"), "key", "s&cret").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/search?q=a%20b&key=s%26cret"
        );
    }

    #[test]
    fn test_strip_request_headers_pins_identity_encoding() {
        let mut h = HeaderMap::new();
        h.insert("host", "proxy.local".parse().unwrap());
        h.insert("connection", "keep-alive".parse().unwrap());
        h.append("accept-encoding", "gzip".parse().unwrap());
        h.append("accept-encoding", "br".parse().unwrap());
        h.insert("x-custom", "yes".parse().unwrap());

        strip_request_headers(&mut h);
        assert!(h.get("host").is_none());
        assert!(h.get("connection").is_none());
        let enc: Vec<&str> = h
            .get_all("accept-encoding")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(enc, vec!["identity"]);
        assert_eq!(h.get("x-custom").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_call_relays_method_path_query_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shodan/scan"))
            .and(query_param("key", "secret-1"))
            .and(query_param("force", "true"))
            .and(header("x-custom", "yes"))
            .and(body_string("ips=1.1.1.1"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "1")
                    .set_body_string(r#"{"id":"scan-1"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_secs(5));
        let mut req = request(Method::POST, "/shodan/scan", Some("force=true"), "ips=1.1.1.1");
        req.headers.insert("x-custom", "yes".parse().unwrap());
        req.headers.insert("host", "proxy.local".parse().unwrap());

        let resp = client.call(req, "secret-1").await.unwrap();
        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.headers.get("x-upstream").unwrap(), "1");
        let body = axum::body::to_bytes(resp.body, usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"id":"scan-1"}"#);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_millis(200));
        let err = client
            .call(request(Method::GET, "/slow", None, ""), "secret-1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_connection_error_hides_secret() {
        let client = client_for("http://127.0.0.1:1", Duration::from_secs(2));
        let err = client
            .call(request(Method::GET, "/x", None, ""), "very-secret-value")
            .await
            .err()
            .unwrap();
        assert!(!err.to_string().contains("very-secret-value"));
    }

    #[tokio::test]
    async fn test_probe_reads_query_credits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api-info"))
            .and(query_param("key", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "scan_credits": 100000,
                "plan": "stream-100",
                "query_credits": 420,
                "unlocked": true
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_secs(5));
        let report = client.probe("good").await.unwrap();
        assert_eq!(report, ProbeReport { valid: true, remaining: 420 });
    }

    #[tokio::test]
    async fn test_probe_zero_credits_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api-info"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"query_credits": 0})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_secs(5));
        assert!(!client.probe("empty").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_probe_error_status_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api-info"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_secs(5));
        let report = client.probe("revoked").await.unwrap();
        assert_eq!(report, ProbeReport { valid: false, remaining: 0 });
    }

    #[tokio::test]
    async fn test_probe_malformed_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api-info"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), Duration::from_secs(5));
        assert!(matches!(
            client.probe("any").await,
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_set_base_url() {
        let client = client_for("https://a.example.com", Duration::from_secs(1));
        client
            .set_base_url(Url::parse("https://b.example.com").unwrap())
            .await;
        assert_eq!(client.base_url().await.host_str(), Some("b.example.com"));
    }
}
