//! Local HTTP endpoint standing in for the client configuration service.
//!
//! Every GET is forwarded upstream. Successful JSON answers are rewritten so
//! the client dials the local relay instead of the real chat server, and the
//! real destination is reported on the notification channel.

pub mod affinity;
pub mod fetch;
pub mod rewrite;

#[cfg(test)]
mod testutils;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{ALLOW, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{Notification, NotificationSender};
use affinity::AffinityResolver;
use fetch::fetch_config;
use rewrite::{affinity_lookup_needed, parse_config, rewrite_config, RewriteError};

pub const DEFAULT_CONFIG_URL: &str = "https://clientconfig.rpg.riotgames.com";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Pause after a failed accept. Errors like EMFILE persist until some
/// connection closes, so retrying at once only spins.
const ACCEPT_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ConfigProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ConfigProxyConfig {
    /// Base URL of the real config service.
    pub upstream_url: String,
    pub affinity_url: String,
    /// Port the relay acceptor listens on; written into `chat.port`.
    pub relay_port: u16,
}

/// Running config proxy. The listener stops when this is dropped.
pub struct ConfigProxy {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ConfigProxy {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn start(
        config: ConfigProxyConfig,
        notifications: NotificationSender,
    ) -> Result<Self, ConfigProxyError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let service = ConfigService::new(config, notifications)?;
        info!(addr = %addr, "Config proxy listening");

        let task = tokio::spawn(serve(listener, service));
        Ok(Self { addr, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// URL to hand to the client as its config service.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ConfigProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: TcpListener, service: ConfigService) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                back_off_after_accept_error(&e).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service.clone();

        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                debug!(peer = %peer, error = %e, "Config connection ended with error");
            }
        });
    }
}

async fn back_off_after_accept_error(e: &std::io::Error) {
    warn!(
        error = %e,
        backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64,
        "Config proxy accept failed"
    );
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

struct ServiceInner {
    client: reqwest::Client,
    upstream_url: String,
    relay_port: u16,
    resolver: AffinityResolver,
    notifications: NotificationSender,
}

#[derive(Clone)]
pub struct ConfigService {
    inner: Arc<ServiceInner>,
}

impl ConfigService {
    pub fn new(
        config: ConfigProxyConfig,
        notifications: NotificationSender,
    ) -> Result<Self, ConfigProxyError> {
        let client = reqwest::Client::builder().build()?;
        let resolver = AffinityResolver::new(client.clone(), config.affinity_url);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                client,
                upstream_url: config.upstream_url,
                relay_port: config.relay_port,
                resolver,
                notifications,
            }),
        })
    }

    async fn handle(self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, _body) = req.into_parts();
        if parts.method != Method::GET {
            let mut response = respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET"));
            return response;
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let upstream = match fetch_config(
            &self.inner.client,
            &self.inner.upstream_url,
            path_and_query,
            &parts.headers,
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(error = %e, "Config upstream unreachable");
                return respond(StatusCode::BAD_GATEWAY, Bytes::from_static(b"{}"));
            }
        };

        if !upstream.status.is_success() {
            debug!(status = upstream.status.as_u16(), "Passing non-success config through");
            return respond(upstream.status, upstream.body);
        }

        match self.rewrite(&parts.headers, &upstream.body).await {
            Ok(body) => respond(upstream.status, body),
            Err(e) => {
                error!(error = %e, "Failed to rewrite client config");
                let _ = self.inner.notifications.send(Notification::Alert {
                    message: format!("Unable to rewrite the client configuration: {}", e),
                    fatal: true,
                });
                respond(upstream.status, upstream.body)
            }
        }
    }

    async fn rewrite(&self, headers: &HeaderMap, body: &[u8]) -> Result<Bytes, RewriteError> {
        let mut doc = parse_config(body)?;

        let region = if affinity_lookup_needed(&doc)? {
            let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
            self.inner.resolver.resolve(authorization).await
        } else {
            None
        };

        let destination = rewrite_config(&mut doc, self.inner.relay_port, region.as_deref())?;
        let rewritten = serde_json::to_vec(&doc)?;

        if let Some(destination) = destination {
            info!(host = %destination.host, port = destination.port, "Resolved chat destination");
            let _ = self
                .inner
                .notifications
                .send(Notification::ChatDestinationResolved(destination));
        }
        Ok(Bytes::from(rewritten))
    }
}

impl Service<Request<Incoming>> for ConfigService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

/// JSON response with an explicit length so nothing is sent chunked.
fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let length = body.len();
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, ChatDestination, NotificationReceiver};
    use crate::config_proxy::testutils::{spawn_upstream, token_with_payload};

    async fn start_proxy(upstream_url: String, affinity_url: String) -> (ConfigProxy, NotificationReceiver) {
        let (tx, rx) = events::channel();
        let proxy = ConfigProxy::start(
            ConfigProxyConfig {
                upstream_url,
                affinity_url,
                relay_port: 6000,
            },
            tx,
        )
        .await
        .unwrap();
        (proxy, rx)
    }

    fn unused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    }

    #[tokio::test]
    async fn test_config_is_rewritten_and_destination_reported() {
        let upstream_body =
            r#"{"chat.host":"chat.example.com","chat.port":5223,"chat.affinity.enabled":false}"#;
        let (upstream, _requests) = spawn_upstream(200, upstream_body.to_string()).await;
        let (proxy, mut rx) = start_proxy(upstream, unused_url()).await;

        let response = reqwest::get(format!("{}/api/v1/config/player", proxy.url()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], JSON_CONTENT_TYPE);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(
            response.text().await.unwrap(),
            r#"{"chat.host":"127.0.0.1","chat.port":6000,"chat.affinity.enabled":false}"#
        );
        assert_eq!(
            rx.recv().await,
            Some(Notification::ChatDestinationResolved(ChatDestination {
                host: "chat.example.com".to_string(),
                port: 5223,
            }))
        );
    }

    #[tokio::test]
    async fn test_only_allowlisted_headers_and_path_are_forwarded() {
        let (upstream, mut requests) = spawn_upstream(200, "{}".to_string()).await;
        let (proxy, _rx) = start_proxy(upstream, unused_url()).await;

        reqwest::Client::new()
            .get(format!("{}/api/v1/config/public?os=windows", proxy.url()))
            .header("Authorization", "Bearer abc")
            .header("X-Riot-Entitlements-JWT", "ent")
            .header("Cookie", "session=1")
            .send()
            .await
            .unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.uri, "/api/v1/config/public?os=windows");
        assert_eq!(request.headers["authorization"], "Bearer abc");
        assert_eq!(request.headers["x-riot-entitlements-jwt"], "ent");
        assert!(request.headers.get("cookie").is_none());
    }

    #[tokio::test]
    async fn test_non_success_passes_through_untouched() {
        let body = r#"{"chat.host":"chat.example.com","chat.port":5223}"#;
        let (upstream, _requests) = spawn_upstream(404, body.to_string()).await;
        let (proxy, mut rx) = start_proxy(upstream, unused_url()).await;

        let response = reqwest::get(format!("{}/missing", proxy.url())).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.text().await.unwrap(), body);

        drop(proxy);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_affinity_region_picks_destination_host() {
        let token = token_with_payload(r#"{"affinity":"euw1"}"#);
        let (affinity, mut affinity_requests) = spawn_upstream(200, token).await;
        let body = r#"{"chat.host":"fallback.chat","chat.port":5223,"chat.affinities":{"na1":"na.chat","euw1":"euw.chat"},"chat.affinity.enabled":true}"#;
        let (upstream, _requests) = spawn_upstream(200, body.to_string()).await;
        let (proxy, mut rx) = start_proxy(upstream, affinity).await;

        let response = reqwest::Client::new()
            .get(format!("{}/api/v1/config/player", proxy.url()))
            .header("Authorization", "Bearer abc")
            .send()
            .await
            .unwrap();
        let rewritten: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(
            rewritten["chat.affinities"],
            serde_json::json!({"na1": "127.0.0.1", "euw1": "127.0.0.1"})
        );

        assert_eq!(
            rx.recv().await,
            Some(Notification::ChatDestinationResolved(ChatDestination {
                host: "euw.chat".to_string(),
                port: 5223,
            }))
        );
        let affinity_request = affinity_requests.recv().await.unwrap();
        assert_eq!(affinity_request.headers["authorization"], "Bearer abc");
    }

    #[tokio::test]
    async fn test_invalid_json_raises_fatal_alert_and_passes_body_through() {
        let (upstream, _requests) = spawn_upstream(200, "not json".to_string()).await;
        let (proxy, mut rx) = start_proxy(upstream, unused_url()).await;

        let response = reqwest::get(format!("{}/api", proxy.url())).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "not json");
        assert!(matches!(rx.recv().await, Some(Notification::Alert { fatal: true, .. })));
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let (upstream, _requests) = spawn_upstream(200, "{}".to_string()).await;
        let (proxy, _rx) = start_proxy(upstream, unused_url()).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api", proxy.url()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 405);
        assert_eq!(response.headers()["allow"], "GET");
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = std::time::Instant::now();
        back_off_after_accept_error(&std::io::Error::other("too many open files")).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let (proxy, mut rx) = start_proxy(unused_url(), unused_url()).await;

        let response = reqwest::get(format!("{}/api", proxy.url())).await.unwrap();
        assert_eq!(response.status(), 502);
        assert_eq!(response.text().await.unwrap(), "{}");
        drop(proxy);
        assert!(rx.try_recv().is_err());
    }
}
