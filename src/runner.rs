// src/runner.rs
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::probe::{ProbeDefinition, ProbeOutcome};
use crate::transport::{RequestContext, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub probe_count: usize,
}

/// Executes a probe table against the proxy, one probe at a time and in table
/// order, all under the same session headers.
pub struct ProbeRunner {
    transport: Transport,
    base_url: String,
    session: RequestContext,
}

impl ProbeRunner {
    pub fn new(transport: Transport, base_url: impl Into<String>, session: RequestContext) -> Self {
        ProbeRunner {
            transport,
            base_url: base_url.into(),
            session,
        }
    }

    /// Streams exactly one outcome per probe; the receiver closes after the last.
    pub fn run(&self, probes: Vec<ProbeDefinition>) -> (mpsc::Receiver<ProbeOutcome>, RunMetadata) {
        let metadata = RunMetadata {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            probe_count: probes.len(),
        };
        let (tx, rx) = mpsc::channel(probes.len().max(1));

        let transport = self.transport.clone();
        let base_url = self.base_url.clone();
        let session = self.session.clone();
        let span = tracing::info_span!("probes", run_id = %metadata.run_id);
        tokio::spawn(
            async move {
                for probe in probes {
                    let outcome = execute(&transport, &session, &base_url, &probe).await;
                    if tx.send(outcome).await.is_err() {
                        debug!("outcome receiver dropped, stopping");
                        break;
                    }
                }
            }
            .instrument(span),
        );

        (rx, metadata)
    }
}

pub async fn execute(
    transport: &Transport,
    session: &RequestContext,
    base_url: &str,
    probe: &ProbeDefinition,
) -> ProbeOutcome {
    let url = format!("{base_url}{}", probe.path);
    debug!(probe = %probe.name, method = %probe.method, %url, "dispatching");
    match transport
        .send(session, probe.method.into(), &url, probe.body.as_ref())
        .await
    {
        Ok(res) => match res.bytes().await {
            Ok(_) => ProbeOutcome::passed(&probe.name),
            Err(e) => ProbeOutcome::failed(&probe.name, e),
        },
        Err(e) => ProbeOutcome::failed(&probe.name, e),
    }
}
