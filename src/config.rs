// src/config.rs
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use reqwest::Url;

use crate::error::HarnessError;

pub const USER_AGENT: &str = "okhttp/3.12.1";
pub const API_PREFIX: &str = "/v0a977/";

pub const DEVICE_MODEL: &str = "PC";
pub const DEVICE_PLATFORM: &str = "Android";
pub const DEVICE_LOCALE: &str = "en_US";

const DEFAULT_API_URL: &str = "https://api.cloudflareclient.com/";
const DEFAULT_LISTEN: &str = "127.0.0.1:8889";
const DEFAULT_CHECK_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream api the proxy forwards to.
    pub api_url: Url,
    /// Where the intercepting proxy listens. Port 0 picks a free port.
    pub listen: SocketAddr,
    /// Bound on the one-time upstream connectivity check.
    pub check_timeout: Duration,
    /// Log every proxied exchange at info instead of debug. On unless
    /// `REGPROBE_DEBUG` is set to a false value.
    pub debug: bool,
    /// Optional JSONL file receiving one record per proxied exchange.
    pub captures: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("REGPROBE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into());
        let api_url = Url::parse(&api_url)
            .map_err(|e| HarnessError::Config(format!("REGPROBE_API_URL `{api_url}`: {e}")))?;

        let listen = lookup("REGPROBE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.into());
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| HarnessError::Config(format!("REGPROBE_LISTEN `{listen}`: {e}")))?;

        let check_timeout_ms = match lookup("REGPROBE_CHECK_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                HarnessError::Config(format!("REGPROBE_CHECK_TIMEOUT_MS `{raw}`: {e}"))
            })?,
            None => DEFAULT_CHECK_TIMEOUT_MS,
        };

        let debug = lookup("REGPROBE_DEBUG")
            .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "no" | "off"))
            .unwrap_or(true);

        let captures = lookup("REGPROBE_CAPTURES")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            api_url,
            listen,
            check_timeout: Duration::from_millis(check_timeout_ms),
            debug,
            captures,
        })
    }

    /// Upstream base without the trailing slash, ready for path concatenation.
    pub fn upstream_base(&self) -> String {
        self.api_url.as_str().trim_end_matches('/').to_string()
    }
}
