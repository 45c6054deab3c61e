// src/test_helpers.rs
use std::{net::SocketAddr, time::Duration};

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;

pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("test server addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
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
