// tests/common/mod.rs
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::Value;
use tokio::{net::TcpListener, sync::Mutex};

use regprobe::config::Config;

#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
    pub body: Option<Value>,
}

/// Stand-in for the remote api: answers registration with a canned body,
/// every other route with 200 unless it is listed in `failing`.
#[derive(Clone)]
pub struct MockApi {
    pub seen: Arc<Mutex<Vec<Seen>>>,
    registration: Value,
    failing: Vec<(Method, String, StatusCode)>,
}

impl MockApi {
    pub fn new(registration: Value) -> Self {
        MockApi {
            seen: Arc::default(),
            registration,
            failing: Vec::new(),
        }
    }

    pub fn failing(mut self, method: Method, path: &str, status: StatusCode) -> Self {
        self.failing.push((method, path.to_string(), status));
        self
    }

    pub async fn api_requests(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .await
            .iter()
            .filter(|s| s.path.starts_with("/v0a977/"))
            .cloned()
            .collect()
    }

    pub async fn serve(&self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(handle).with_state(self.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(addr)
    }
}

async fn handle(
    State(api): State<MockApi>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let path = uri.path().to_string();
    api.seen.lock().await.push(Seen {
        method: method.to_string(),
        path: path.clone(),
        authorization: header("authorization"),
        user_agent: header("user-agent"),
        body: serde_json::from_slice(&body).ok(),
    });

    if let Some((_, _, status)) = api
        .failing
        .iter()
        .find(|(m, p, _)| *m == method && *p == path)
    {
        return (*status, "forced failure").into_response();
    }
    if method == Method::POST && path == "/v0a977/reg" {
        return Json(api.registration.clone()).into_response();
    }
    Json(serde_json::json!({ "success": true })).into_response()
}

pub fn config_for(upstream: SocketAddr) -> Config {
    Config {
        api_url: format!("http://{upstream}/").parse().expect("upstream url"),
        listen: "127.0.0.1:0".parse().expect("listen addr"),
        check_timeout: Duration::from_secs(2),
        debug: true,
        captures: None,
    }
}
