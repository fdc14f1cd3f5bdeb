//! Public HTTP/HTTPS endpoint. URL pseudo-records resolve to either an
//! HTTP redirect or a streaming reverse proxy; the HTTPS listener resolves
//! certificates per SNI name on demand and both listeners stamp the same
//! security header set on every response.

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;

use super::tls::TlsManager;
use crate::config::Config;
use crate::error::Result;
use crate::store::KeyStore;
use crate::zone::{RecordType, RecordValue, ZoneStore};

/// Marker the loop detector looks for in `X-CDN-Loop`
const LOOP_MARKER: &str = "PendingDNS";

const DEFAULT_404: &str = r#"<!DOCTYPE html>
<html>
  <head><title>404 Not Found</title></head>
  <body><h1>404 Not Found</h1><p>The requested host is not served here.</p></body>
</html>
"#;

const DEFAULT_500: &str = r#"<!DOCTYPE html>
<html>
  <head><title>500 Internal Server Error</title></head>
  <body><h1>500 Internal Server Error</h1></body>
</html>
"#;

const REDIRECT_BODY: &str = r#"<!DOCTYPE html>
<html>
  <head><title>Moved</title></head>
  <body><h1>Moved Permanently</h1><p>The document has moved.</p></body>
</html>
"#;

/// Peer address attached per connection
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Shared state of one public listener
pub struct PublicState<S: KeyStore> {
    pub zones: Arc<ZoneStore<S>>,
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    /// Whether this listener terminates TLS
    pub tls: bool,
}

impl<S: KeyStore> Clone for PublicState<S> {
    fn clone(&self) -> Self {
        Self {
            zones: self.zones.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            tls: self.tls,
        }
    }
}

impl<S: KeyStore> PublicState<S> {
    pub fn new(zones: Arc<ZoneStore<S>>, config: Arc<Config>, tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| crate::error::DnsError::external(format!("proxy client: {}", e)))?;
        Ok(Self {
            zones,
            config,
            client,
            tls,
        })
    }
}

/// Build the catch-all router for one listener
pub fn build_router<S: KeyStore + 'static>(state: PublicState<S>) -> Router {
    Router::new()
        .fallback(handle_request::<S>)
        .with_state(state)
}

/// Serve plain HTTP
pub async fn serve_http<S: KeyStore + 'static>(
    state: PublicState<S>,
    listener: TcpListener,
) -> Result<()> {
    tracing::info!("public HTTP listening on {}", listener.local_addr()?);
    let router = build_router(state);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("HTTP accept failed: {}", err);
                continue;
            }
        };
        let service = router.clone().layer(Extension(ClientAddr(peer)));
        tokio::spawn(async move {
            let hyper_service = TowerToHyperService::new(service);
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), hyper_service)
                .await
            {
                tracing::trace!("HTTP connection from {} ended: {}", peer, err);
            }
        });
    }
}

/// Serve HTTPS with on-demand SNI certificate resolution
pub async fn serve_https<S: KeyStore + Clone + 'static>(
    state: PublicState<S>,
    tls: Arc<TlsManager<S>>,
    listener: TcpListener,
) -> Result<()> {
    tracing::info!("public HTTPS listening on {}", listener.local_addr()?);
    let router = build_router(state);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("HTTPS accept failed: {}", err);
                continue;
            }
        };
        let service = router.clone().layer(Extension(ClientAddr(peer)));
        let tls = tls.clone();
        tokio::spawn(async move {
            let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match acceptor.await {
                Ok(start) => start,
                Err(err) => {
                    tracing::trace!("TLS client hello from {} failed: {}", peer, err);
                    return;
                }
            };

            let server_name = start.client_hello().server_name().map(str::to_string);
            let config = tls.config_for(server_name.as_deref()).await;
            let stream = match start.into_stream(config).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::trace!("TLS handshake with {} failed: {}", peer, err);
                    return;
                }
            };

            let hyper_service = TowerToHyperService::new(service);
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), hyper_service)
                .await
            {
                tracing::trace!("HTTPS connection from {} ended: {}", peer, err);
            }
        });
    }
}

/// The catch-all request handler: loop detection, URL record lookup,
/// then redirect or reverse proxy.
async fn handle_request<S: KeyStore + 'static>(
    State(state): State<PublicState<S>>,
    peer: Option<Extension<ClientAddr>>,
    req: Request,
) -> Response {
    if loop_detected(req.headers()) {
        tracing::debug!("rejecting looped request");
        return html_response(StatusCode::LOOP_DETECTED, DEFAULT_500);
    }

    let Some(hostname) = request_hostname(&req) else {
        return not_found(&state.config);
    };

    let records = match state
        .zones
        .resolve(&hostname, RecordType::URL, true)
        .await
    {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!("URL lookup for {} failed: {}", hostname, err);
            return server_error(&state.config);
        }
    };
    let Some(RecordValue::Url { url, code, proxy }) =
        records.into_iter().next().map(|record| record.value)
    else {
        return not_found(&state.config);
    };

    if proxy {
        proxy_request(&state, peer.map(|Extension(addr)| addr), req, &url).await
    } else {
        redirect_response(&req, &url, code)
    }
}

/// Hostname from `Host` or, for HTTP/2, the `:authority` carried in the
/// request URI. Port and IPv6 brackets are stripped.
fn request_hostname(req: &Request) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|authority| authority.to_string()))?;

    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        raw.rsplit_once(':')
            .map(|(host, port)| {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    host
                } else {
                    raw
                }
            })
            .unwrap_or(raw)
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn loop_detected(headers: &HeaderMap) -> bool {
    headers
        .get_all("x-cdn-loop")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(LOOP_MARKER))
}

/// Redirect per the URL record. A bare target (path `/`, no query) aliases
/// the incoming path and query onto the target; anything else redirects to
/// the target verbatim.
fn redirect_response(req: &Request, target: &str, code: u16) -> Response {
    let Ok(mut location) = url::Url::parse(target) else {
        tracing::warn!("stored URL record target is unparseable: {}", target);
        return html_response(StatusCode::INTERNAL_SERVER_ERROR, DEFAULT_500);
    };

    if location.path() == "/" && location.query().is_none() {
        location.set_path(req.uri().path());
        location.set_query(req.uri().query());
    }

    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::MOVED_PERMANENTLY);
    let mut response = Response::builder()
        .status(status)
        .header(header::LOCATION, location.to_string())
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(REDIRECT_BODY))
        .unwrap_or_default();
    security_headers(response.headers_mut());
    response
}

/// Stream the request to the URL record's origin and the answer back.
/// The upstream request is rebuilt from scratch, so HTTP/2 pseudo-headers
/// never leak through; forwarding metadata is injected explicitly.
async fn proxy_request<S: KeyStore>(
    state: &PublicState<S>,
    peer: Option<ClientAddr>,
    req: Request,
    target: &str,
) -> Response {
    let Ok(mut upstream) = url::Url::parse(target) else {
        tracing::warn!("stored URL record target is unparseable: {}", target);
        return server_error(&state.config);
    };
    upstream.set_path(req.uri().path());
    upstream.set_query(req.uri().query());

    let method = req.method().clone();
    let mut builder = state.client.request(method, upstream.to_string());
    for (name, value) in req.headers() {
        if is_end_to_end(name.as_str()) {
            builder = builder.header(name.clone(), value.clone());
        }
    }
    builder = builder
        .header("x-cdn-loop", LOOP_MARKER)
        .header(
            "x-forwarded-proto",
            if state.tls { "https" } else { "http" },
        );
    if let Some(ClientAddr(addr)) = peer {
        builder = builder.header("x-connecting-ip", addr.ip().to_string());
    }

    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
    let upstream_response = match builder.body(body).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("proxy upstream failed: {}", err);
            return html_response(StatusCode::BAD_GATEWAY, DEFAULT_500);
        }
    };

    let mut response = Response::builder().status(upstream_response.status());
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream_response.headers() {
            if is_end_to_end(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    let mut response = response
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .unwrap_or_default();
    security_headers(response.headers_mut());
    response
}

/// Hop-by-hop headers stay on their own hop
fn is_end_to_end(name: &str) -> bool {
    !matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-cdn-loop"
            | "content-length"
    )
}

fn not_found(config: &Config) -> Response {
    let body = config
        .public
        .errors
        .error404
        .clone()
        .unwrap_or_else(|| DEFAULT_404.to_string());
    html_response(StatusCode::NOT_FOUND, &body)
}

fn server_error(config: &Config) -> Response {
    let body = config
        .public
        .errors
        .error500
        .clone()
        .unwrap_or_else(|| DEFAULT_500.to_string());
    html_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
}

fn html_response(status: StatusCode, body: &str) -> Response {
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap_or_default();
    security_headers(response.headers_mut());
    response
}

/// Header set stamped on every public response
fn security_headers(headers: &mut HeaderMap) {
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=15552000; includeSubDomains; preload"),
    );
    headers.insert("x-cdn-loop", HeaderValue::from_static(LOOP_MARKER));
    headers.insert(
        header::SERVER,
        HeaderValue::from_static(concat!("PendingDNS/", env!("CARGO_PKG_VERSION"))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::store::MemoryStore;

    async fn state_with_redirect(proxy: bool) -> PublicState<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        let zones = Arc::new(ZoneStore::new(store));
        zones
            .add(
                "example.com",
                "go",
                RecordType::URL,
                &json!(["https://target.example.org/", 302, proxy]),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        PublicState::new(zones, Arc::new(Config::default()), false).unwrap()
    }

    #[tokio::test]
    async fn test_redirect_aliases_path() {
        let app = build_router(state_with_redirect(false).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/some/path?x=1")
                    .header("host", "go.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://target.example.org/some/path?x=1"
        );
        assert_eq!(
            response.headers().get("x-frame-options").unwrap(),
            "DENY"
        );
        assert!(
            response
                .headers()
                .get(header::SERVER)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("PendingDNS/")
        );
    }

    #[tokio::test]
    async fn test_unknown_host_renders_404() {
        let app = build_router(state_with_redirect(false).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("host", "nobody.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("404"));
    }

    #[tokio::test]
    async fn test_loop_detection_rejects() {
        let app = build_router(state_with_redirect(false).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("host", "go.example.com")
                    .header("x-cdn-loop", "other, PendingDNS")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
    }

    #[test]
    fn test_request_hostname_strips_port_and_brackets() {
        let req = Request::builder()
            .uri("/")
            .header("host", "Example.COM:8443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_hostname(&req), Some("example.com".to_string()));

        let req = Request::builder()
            .uri("/")
            .header("host", "[2001:db8::1]:443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_hostname(&req), Some("2001:db8::1".to_string()));
    }
}
