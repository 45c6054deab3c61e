// src/proxy.rs
//! Local intercepting proxy. Every request it receives is relayed to the
//! upstream api through the pinned [`Transport`] and captured on the way back.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::{timeout, Instant},
};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureLog, CaptureRecord};
use crate::config::Config;
use crate::error::HarnessError;
use crate::transport::Transport;

// hop-by-hop headers never cross the proxy, nor do the ones it recomputes
static STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

struct ProxyState {
    transport: Transport,
    upstream: String,
    captures: CaptureLog,
    debug: bool,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ProxyHandle {
    local_addr: SocketAddr,
    captures: CaptureLog,
    errors: mpsc::Receiver<String>,
    stopping: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    server: AbortHandle,
    supervisor: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn captures(&self) -> &CaptureLog {
        &self.captures
    }

    /// Yields a message once if the server stops without being asked to.
    /// Stays open and silent for as long as the proxy is healthy.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<String> {
        &mut self.errors
    }

    #[cfg(test)]
    pub(crate) fn server_abort_handle(&self) -> AbortHandle {
        self.server.clone()
    }

    /// Stops accepting, lets in-flight exchanges finish and returns how many
    /// exchanges were captured. A server that does not drain within the grace
    /// period is aborted.
    pub async fn shutdown(mut self) -> usize {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(());
        }
        if timeout(SHUTDOWN_GRACE, &mut self.supervisor).await.is_err() {
            warn!(addr = %self.local_addr, "proxy did not drain in time, aborting");
            self.server.abort();
            let _ = (&mut self.supervisor).await;
        }
        let captured = self.captures.len().await;
        info!(captured, "intercepting proxy stopped");
        captured
    }
}

pub async fn start(config: &Config, transport: Transport) -> Result<ProxyHandle, HarnessError> {
    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(HarnessError::ProxyStart)?;
    let local_addr = listener.local_addr().map_err(HarnessError::ProxyStart)?;

    transport
        .reachable(config.api_url.as_str(), config.check_timeout)
        .await
        .map_err(HarnessError::Connectivity)?;

    let captures = CaptureLog::open(config.captures.as_deref())
        .await
        .map_err(HarnessError::ProxyStart)?;

    let state = Arc::new(ProxyState {
        transport,
        upstream: config.upstream_base(),
        captures: captures.clone(),
        debug: config.debug,
    });

    let app = Router::new().fallback(relay).with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(30))),
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });
    let server_abort = server.abort_handle();

    let (err_tx, err_rx) = mpsc::channel(1);
    let stopping = Arc::new(AtomicBool::new(false));
    let supervisor = tokio::spawn(supervise(server, stopping.clone(), err_tx));

    info!(%local_addr, upstream = %config.api_url, "intercepting proxy listening");
    Ok(ProxyHandle {
        local_addr,
        captures,
        errors: err_rx,
        stopping,
        shutdown: Some(stop_tx),
        server: server_abort,
        supervisor,
    })
}

/// Any end of the server task that shutdown did not ask for is fatal.
async fn supervise(
    server: JoinHandle<std::io::Result<()>>,
    stopping: Arc<AtomicBool>,
    errors: mpsc::Sender<String>,
) {
    let ended = server.await;
    if stopping.load(Ordering::SeqCst) {
        if let Ok(Err(e)) = ended {
            warn!(error = %e, "proxy reported an error while stopping");
        }
        return;
    }
    let reason = match ended {
        Ok(Ok(())) => "server stopped without a shutdown request".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => format!("server task panicked: {e}"),
        Err(e) => format!("server task ended: {e}"),
    };
    error!(%reason, "intercepting proxy failed");
    let _ = errors.send(reason).await;
}

// ---------- RELAY ---------- //

async fn relay(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let target = format!("{}{}", state.upstream, path);

    let response = match state
        .transport
        .forward(method.clone(), &target, strip(&headers), body)
        .await
    {
        Ok(upstream) => into_response(upstream).await,
        Err(e) => {
            warn!(error = %e, %target, "upstream exchange failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    };

    let record = CaptureRecord::new(
        method.as_str(),
        path,
        response.status().as_u16(),
        started.elapsed(),
    );
    if state.debug {
        info!(method = %record.method, uri = %record.uri, status = record.status, duration_ms = record.duration_ms, "captured");
    } else {
        debug!(method = %record.method, uri = %record.uri, status = record.status, duration_ms = record.duration_ms, "captured");
    }
    state.captures.record(record).await;

    response
}

async fn into_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = strip(upstream.headers());
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut res = Response::new(Body::from(bytes));
            *res.status_mut() = status;
            *res.headers_mut() = headers;
            res
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream body");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

fn strip(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in STRIPPED_HEADERS {
        out.remove(*name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{config_for, serve};
    use axum::{routing::get, Json};
    use serde_json::{json, Value};

    fn upstream() -> Router {
        Router::new()
            .route(
                "/v0a977/client_config",
                get(|headers: HeaderMap| async move {
                    let ua = headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({ "ua": ua }))
                }),
            )
            .route(
                "/v0a977/reg/missing",
                get(|| async { (StatusCode::NOT_FOUND, "no such device") }),
            )
    }

    #[tokio::test]
    async fn relays_and_captures() {
        let addr = serve(upstream()).await;
        let proxy = start(&config_for(addr), Transport::new().unwrap())
            .await
            .unwrap();
        let client = reqwest::Client::new();

        let ok: Value = client
            .get(format!("{}/v0a977/client_config", proxy.base_url()))
            .header("user-agent", "okhttp/3.12.1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ok["ua"], "okhttp/3.12.1");

        let missing = client
            .get(format!("{}/v0a977/reg/missing?x=1", proxy.base_url()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(missing.text().await.unwrap(), "no such device");

        let records = proxy.captures().snapshot().await;
        let seen: Vec<_> = records
            .iter()
            .map(|r| (r.method.as_str(), r.uri.as_str(), r.status))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("GET", "/v0a977/client_config", 200),
                ("GET", "/v0a977/reg/missing?x=1", 404),
            ]
        );
        assert_eq!(proxy.shutdown().await, 2);
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let err = start(&config_for(dead), Transport::new().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::Connectivity(_)));
    }

    #[tokio::test]
    async fn occupied_listen_address_fails_start() {
        let addr = serve(upstream()).await;
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config_for(addr);
        cfg.listen = taken.local_addr().unwrap();

        let err = start(&cfg, Transport::new().unwrap()).await.err().unwrap();
        assert!(matches!(err, HarnessError::ProxyStart(_)));
    }

    #[tokio::test]
    async fn dead_server_is_reported() {
        let addr = serve(upstream()).await;
        let mut proxy = start(&config_for(addr), Transport::new().unwrap())
            .await
            .unwrap();

        proxy.server_abort_handle().abort();
        let reason = timeout(Duration::from_secs(2), proxy.errors().recv())
            .await
            .expect("supervisor reports in time");
        assert!(reason.unwrap().contains("server task ended"));

        let proxy_addr = proxy.local_addr();
        proxy.shutdown().await;
        assert!(TcpListener::bind(proxy_addr).await.is_ok());
    }

    #[tokio::test]
    async fn requested_shutdown_is_silent() {
        let addr = serve(upstream()).await;
        let mut proxy = start(&config_for(addr), Transport::new().unwrap())
            .await
            .unwrap();

        let quiet = timeout(Duration::from_millis(200), proxy.errors().recv()).await;
        assert!(quiet.is_err(), "healthy proxy must not report");

        let proxy_addr = proxy.local_addr();
        assert_eq!(proxy.shutdown().await, 0);
        assert!(TcpListener::bind(proxy_addr).await.is_ok());
    }

    #[test]
    fn strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("host", "127.0.0.1".parse().unwrap());
        headers.insert("authorization", "Bearer tok1".parse().unwrap());
        let out = strip(&headers);
        assert!(out.get("connection").is_none());
        assert!(out.get("host").is_none());
        assert_eq!(out.get("authorization").unwrap(), "Bearer tok1");
    }
}
