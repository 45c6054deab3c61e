// src/probe.rs
use std::fmt;

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::API_PREFIX;
use crate::registration::RegistrationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Get,
    Post,
    Patch,
    Put,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Get => "GET",
            ProbeMethod::Post => "POST",
            ProbeMethod::Patch => "PATCH",
            ProbeMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProbeMethod> for Method {
    fn from(m: ProbeMethod) -> Self {
        match m {
            ProbeMethod::Get => Method::GET,
            ProbeMethod::Post => Method::POST,
            ProbeMethod::Patch => Method::PATCH,
            ProbeMethod::Put => Method::PUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeDefinition {
    pub name: String,
    pub body: Option<Value>,
    pub path: String,
    pub method: ProbeMethod,
}

impl ProbeDefinition {
    fn new(name: &str, method: ProbeMethod, path: String, body: Option<Value>) -> Self {
        ProbeDefinition {
            name: name.to_string(),
            body,
            path,
            method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub name: String,
    pub result: Result<(), String>,
}

impl ProbeOutcome {
    pub fn passed(name: &str) -> Self {
        ProbeOutcome {
            name: name.to_string(),
            result: Ok(()),
        }
    }

    pub fn failed(name: &str, cause: impl fmt::Display) -> Self {
        ProbeOutcome {
            name: name.to_string(),
            result: Err(format!("{name}: {cause}")),
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

fn api_path(rel: &str) -> String {
    format!("{API_PREFIX}{rel}")
}

/// The fixed probe sequence run after registration. Order matters: the second
/// devices listing observes the name set just before it.
pub fn probe_table(reg: &RegistrationContext) -> Vec<ProbeDefinition> {
    use ProbeMethod::*;

    let id = &reg.device_id;
    let device = api_path(&format!("reg/{id}"));
    let account = api_path(&format!("reg/{id}/account"));
    let devices = api_path(&format!("reg/{id}/account/devices"));
    let account_device = api_path(&format!("reg/{id}/account/reg/{id}"));

    vec![
        ProbeDefinition::new("get device", Get, device.clone(), None),
        ProbeDefinition::new("get account", Get, account.clone(), None),
        ProbeDefinition::new("get account devices", Get, devices.clone(), None),
        ProbeDefinition::new(
            "set device active",
            Patch,
            account_device.clone(),
            Some(json!({ "active": true })),
        ),
        ProbeDefinition::new(
            "set device name",
            Patch,
            account_device,
            Some(json!({ "name": "TEST" })),
        ),
        ProbeDefinition::new(
            "get account devices, this time with the name set",
            Get,
            devices,
            None,
        ),
        ProbeDefinition::new("get client config", Get, api_path("client_config"), None),
        // re-submits the license we already hold: assignment only, not rotation
        ProbeDefinition::new(
            "set license key",
            Put,
            account.clone(),
            Some(json!({ "license": reg.license })),
        ),
        ProbeDefinition::new(
            "set public key",
            Patch,
            device,
            Some(json!({ "key": reg.replacement_key.to_string() })),
        ),
        ProbeDefinition::new(
            "recreate license key",
            Post,
            api_path(&format!("reg/{id}/account/license")),
            None,
        ),
    ]
}
