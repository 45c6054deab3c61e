// src/sequencer.rs
//! Registers a synthetic device through the intercepting proxy, then runs the
//! dependent probe table with the session that registration produced.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument};

use crate::config::{Config, USER_AGENT};
use crate::error::HarnessError;
use crate::keys::KeyPair;
use crate::probe::{probe_table, ProbeOutcome};
use crate::proxy::{self, ProxyHandle};
use crate::registration;
use crate::runner::{ProbeRunner, RunMetadata};
use crate::transport::{RequestContext, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Registering,
    Registered,
    RunningProbes,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Registering => "registering",
            RunState::Registered => "registered",
            RunState::RunningProbes => "running probes",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn advance(state: &mut RunState, next: RunState) {
    info!(from = %state, to = %next, "run state");
    *state = next;
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub outcomes: Vec<ProbeOutcome>,
    pub captured: usize,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(ProbeOutcome::failure)
    }

    /// One line per failed probe; empty when everything passed.
    pub fn aggregate_failure(&self) -> String {
        let mut text = String::new();
        for failure in self.failures() {
            text.push_str(failure);
            text.push('\n');
        }
        text
    }

    pub fn into_result(self) -> Result<Self, HarnessError> {
        let text = self.aggregate_failure();
        if text.is_empty() {
            Ok(self)
        } else {
            Err(HarnessError::ProbesFailed(text))
        }
    }
}

/// One complete run. The proxy is always shut down before this returns, also
/// when registration or the proxy itself failed.
pub async fn run(config: &Config) -> Result<RunReport, HarnessError> {
    let transport = Transport::new()?;
    let proxy = proxy::start(config, transport.clone()).await?;
    run_with(proxy, transport).await
}

/// Runs the sequence through an already started proxy and shuts it down afterwards.
pub async fn run_with(mut proxy: ProxyHandle, transport: Transport) -> Result<RunReport, HarnessError> {
    info!(proxy = %proxy.local_addr(), "starting run");
    let driven = drive(&mut proxy, transport).await;
    let captured = proxy.shutdown().await;

    let (metadata, outcomes) = driven?;
    Ok(RunReport {
        metadata,
        outcomes,
        captured,
    })
}

async fn drive(
    proxy: &mut ProxyHandle,
    transport: Transport,
) -> Result<(RunMetadata, Vec<ProbeOutcome>), HarnessError> {
    let mut state = RunState::Idle;
    let base_url = proxy.base_url();

    let current = KeyPair::generate();
    let replacement = KeyPair::generate();
    let anonymous = RequestContext::new(USER_AGENT);

    advance(&mut state, RunState::Registering);
    let registered = tokio::select! {
        biased;
        e = proxy.errors().recv() => Err(proxy_failed(e)),
        res = registration::register(
            &transport,
            &anonymous,
            &base_url,
            current.public(),
            replacement.public(),
        ) => res,
    };
    let reg = match registered {
        Ok(reg) => reg,
        Err(e) => {
            advance(&mut state, RunState::Failed);
            error!(error = %e, "registration failed");
            return Err(e);
        }
    };
    advance(&mut state, RunState::Registered);

    let session = anonymous.authenticated(&reg.access_token);
    let runner = ProbeRunner::new(transport, base_url, session);
    let (mut outcomes, metadata) = runner.run(probe_table(&reg));

    advance(&mut state, RunState::RunningProbes);
    let span = tracing::info_span!("run", run_id = %metadata.run_id);
    let collected = collect(&mut outcomes, proxy.errors()).instrument(span).await;
    match collected {
        Ok(outcomes) => {
            advance(&mut state, RunState::Completed);
            Ok((metadata, outcomes))
        }
        Err(e) => {
            advance(&mut state, RunState::Failed);
            Err(e)
        }
    }
}

// a closed channel means the supervisor is gone, which is as fatal as a report
fn proxy_failed(reported: Option<String>) -> HarnessError {
    HarnessError::ProxyFailed(
        reported.unwrap_or_else(|| "proxy supervisor went away".to_string()),
    )
}

/// Drains the outcome stream to its end unless the proxy reports a failure first.
pub async fn collect(
    outcomes: &mut mpsc::Receiver<ProbeOutcome>,
    proxy_errors: &mut mpsc::Receiver<String>,
) -> Result<Vec<ProbeOutcome>, HarnessError> {
    let mut collected = Vec::new();
    loop {
        tokio::select! {
            biased;
            e = proxy_errors.recv() => {
                warn!(completed = collected.len(), "proxy failed while probes were running");
                return Err(proxy_failed(e));
            }
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => {
                    match outcome.failure() {
                        Some(cause) => warn!(probe = %outcome.name, %cause, "probe failed"),
                        None => info!(probe = %outcome.name, "probe passed"),
                    }
                    collected.push(outcome);
                }
                None => return Ok(collected),
            },
        }
    }
}
