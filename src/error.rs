// src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("bad code: {0}")]
    BadStatus(u16),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::BadStatus(code) => Some(*code),
            _ => None,
        }
    }
}

/// Registration response did not have the shape later probes depend on.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("registration response is not valid json: {0}")]
    Body(#[from] serde_json::Error),

    #[error("registration response is missing `{field}`")]
    Missing { field: &'static str },

    #[error("registration response field `{field}` is not a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to start intercepting proxy: {0}")]
    ProxyStart(#[source] std::io::Error),

    #[error("upstream api unreachable: {0}")]
    Connectivity(#[source] TransportError),

    #[error("registration failed: {0}")]
    Registration(#[source] TransportError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("intercepting proxy failed: {0}")]
    ProxyFailed(String),

    #[error("{0}")]
    ProbesFailed(String),
}
