// src/registration.rs
use chrono::{SecondsFormat, Utc};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::{API_PREFIX, DEVICE_LOCALE, DEVICE_MODEL, DEVICE_PLATFORM};
use crate::error::{HarnessError, ShapeError};
use crate::keys::PublicKey;
use crate::transport::{RequestContext, Transport};

#[derive(Debug, Serialize)]
pub struct RegistrationReq {
    pub key: String,
    // left empty: a real device always fills these two in
    pub install_id: String,
    pub fcm_token: String,
    pub tos: String,
    pub model: String,
    #[serde(rename = "type")]
    pub platform: String,
    pub locale: String,
}

impl RegistrationReq {
    pub fn new(key: &PublicKey) -> Self {
        RegistrationReq {
            key: key.to_string(),
            install_id: String::new(),
            fcm_token: String::new(),
            tos: Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
            model: DEVICE_MODEL.into(),
            platform: DEVICE_PLATFORM.into(),
            locale: DEVICE_LOCALE.into(),
        }
    }
}

/// Fields of the registration response the later probes need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRes {
    pub device_id: String,
    pub token: String,
    pub license: String,
}

impl RegistrationRes {
    pub fn decode(body: &[u8]) -> Result<Self, ShapeError> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(RegistrationRes {
            device_id: string_at(&value, "id")?,
            token: string_at(&value, "token")?,
            license: string_at(&value, "account.license")?,
        })
    }
}

fn string_at(value: &Value, path: &'static str) -> Result<String, ShapeError> {
    let mut current = value;
    for segment in path.split('.') {
        let object = current.as_object().ok_or(ShapeError::WrongType {
            field: path,
            expected: "object",
        })?;
        current = object
            .get(segment)
            .ok_or(ShapeError::Missing { field: path })?;
    }
    current
        .as_str()
        .map(str::to_string)
        .ok_or(ShapeError::WrongType {
            field: path,
            expected: "string",
        })
}

/// Everything the probe table is built from.
#[derive(Debug, Clone)]
pub struct RegistrationContext {
    pub device_id: String,
    pub access_token: String,
    pub license: String,
    pub current_key: PublicKey,
    pub replacement_key: PublicKey,
}

pub async fn register(
    transport: &Transport,
    ctx: &RequestContext,
    base_url: &str,
    current_key: PublicKey,
    replacement_key: PublicKey,
) -> Result<RegistrationContext, HarnessError> {
    let req = serde_json::to_value(RegistrationReq::new(&current_key)).map_err(ShapeError::from)?;
    let url = format!("{base_url}{API_PREFIX}reg");

    let res = transport
        .send(ctx, Method::POST, &url, Some(&req))
        .await
        .map_err(HarnessError::Registration)?;
    let body = res
        .bytes()
        .await
        .map_err(|e| HarnessError::Registration(e.into()))?;
    let decoded = RegistrationRes::decode(&body)?;

    info!(device_id = %decoded.device_id, "device registered");
    Ok(RegistrationContext {
        device_id: decoded.device_id,
        access_token: decoded.token,
        license: decoded.license,
        current_key,
        replacement_key,
    })
}
