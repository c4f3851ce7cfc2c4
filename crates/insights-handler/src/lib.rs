// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-handler
#![deny(unsafe_code)]
//!
//! The dispatcher at the heart of the service. Every broker delivery runs
//! through [`Processor::handle`], which classifies the envelope, routes it
//! down a direct path or the inferred pipeline, and returns the
//! acknowledgement decision the consumer executes.
//!
//! Per message the state machine is
//! `Received → Classified → (DirectWrite | Pipelined) → (Enriched?) →
//! Archived? → AckOrReject`; nothing persists between states, so any
//! mid-path failure resolves to a reject (possibly with a republish).

/// Typed direct envelope processing.
pub mod direct;

use async_trait::async_trait;
use direct::DirectError;
use insights_broker::{Disposition, MessageHandler};
use insights_core::classify::{InsightsDescriptor, PayloadShape, classify};
use insights_core::sink::{FindingsSink, SinkError};
use insights_core::{Envelope, MAX_REQUEUE_ATTEMPTS, Problem, ResolvedTarget};
use insights_enrich::EnrichmentQueue;
use insights_pipeline::{Findings, FilterOutput, Pipeline};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The message processor: dispatcher, retry controller, and glue between
/// pipeline, sink, archiver, and enricher.
pub struct Processor {
    pipeline: Pipeline,
    sink: Arc<dyn FindingsSink>,
    archiver: Option<insights_archive::Archiver>,
    enrichment: Option<EnrichmentQueue>,
    api_disabled: bool,
}

impl Processor {
    /// Build a processor writing through `sink`, with archiving, enrichment,
    /// and the API integration all enabled-by-configuration via the `with_*`
    /// builders.
    pub fn new(pipeline: Pipeline, sink: Arc<dyn FindingsSink>) -> Self {
        Self {
            pipeline,
            sink,
            archiver: None,
            enrichment: None,
            api_disabled: false,
        }
    }

    /// Attach the object-store archiver.
    #[must_use]
    pub fn with_archiver(mut self, archiver: insights_archive::Archiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Attach the enrichment queue.
    #[must_use]
    pub fn with_enrichment(mut self, queue: EnrichmentQueue) -> Self {
        self.enrichment = Some(queue);
        self
    }

    /// Disable upstream API writes (archive-only operation).
    #[must_use]
    pub fn with_api_disabled(mut self, disabled: bool) -> Self {
        self.api_disabled = disabled;
        self
    }

    // -- Retry controller ---------------------------------------------------

    /// Transient failure: republish a mutated envelope while attempts
    /// remain, drop terminally otherwise.
    fn retry_or_drop(&self, envelope: &Envelope, reason: &str) -> Disposition {
        if envelope.requeue_attempts < MAX_REQUEUE_ATTEMPTS {
            warn!(
                attempts = envelope.requeue_attempts,
                reason, "transient failure; republishing envelope"
            );
            Disposition::Republish(envelope.requeued())
        } else {
            error!(
                attempts = envelope.requeue_attempts,
                reason, "transient failure exhausted its retries; dropping envelope"
            );
            Disposition::Reject
        }
    }

    fn sink_failure(&self, envelope: &Envelope, err: &SinkError) -> Disposition {
        if err.is_transient() {
            self.retry_or_drop(envelope, &err.to_string())
        } else {
            error!(%err, "permanent sink failure; rejecting envelope");
            Disposition::Reject
        }
    }

    fn direct_failure(&self, envelope: &Envelope, err: DirectError) -> Disposition {
        match err {
            // The envelope decoded but its typed body did not: drop it the
            // same way a malformed envelope is dropped.
            DirectError::Malformed(err) => {
                error!(%err, "could not parse direct message body");
                Disposition::Ack
            }
            DirectError::MissingEnvironment => {
                error!("direct message carries no environment id");
                Disposition::Reject
            }
            DirectError::Sink(err) => self.sink_failure(envelope, &err),
        }
    }

    // -- Inferred path ------------------------------------------------------

    async fn process_inferred(&self, envelope: &Envelope) -> Disposition {
        let classification = match classify(envelope) {
            Ok(classification) => classification,
            Err(err) => {
                warn!(%err, "rejecting unclassifiable envelope");
                return Disposition::Reject;
            }
        };
        let descriptor = classification.descriptor;
        let target = classification.target;

        if let Some(archiver) = &self.archiver
            && let Err(err) = archiver.archive(envelope, &descriptor, &target).await
        {
            warn!(%err, "unable to archive payload");
            return self.retry_or_drop(envelope, "archive upload failed");
        }

        if self.api_disabled {
            return Disposition::Ack;
        }

        let resolved = match self.sink.resolve(&target).await {
            Ok(resolved) => resolved,
            Err(err) => return self.sink_failure(envelope, &err),
        };

        let items: Vec<String> = match descriptor.payload_shape {
            PayloadShape::Json => envelope
                .payload
                .iter()
                .flatten()
                .map(ToString::to_string)
                .collect(),
            PayloadShape::Binary => envelope
                .binary_payload
                .iter()
                .flatten()
                .map(|(_, encoded)| encoded.clone())
                .collect(),
        };

        for item in &items {
            match self.process_payload_item(envelope, &descriptor, item, &resolved).await {
                Ok(()) => {}
                Err(disposition) => return disposition,
            }
        }

        Disposition::Ack
    }

    async fn process_payload_item(
        &self,
        envelope: &Envelope,
        descriptor: &InsightsDescriptor,
        item: &str,
        resolved: &ResolvedTarget,
    ) -> Result<(), Disposition> {
        let outputs = match self.pipeline.process_item(descriptor, item, resolved) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(%err, "pipeline failed for payload item");
                return Err(Disposition::Reject);
            }
        };

        for output in outputs {
            let FilterOutput {
                source,
                findings,
                sbom,
            } = output;

            match findings {
                Findings::Facts(facts) => {
                    info!(
                        source,
                        facts = facts.len(),
                        project = %resolved.project,
                        environment = %resolved.environment,
                        "writing facts"
                    );
                    if let Err(err) = self
                        .sink
                        .replace_facts(resolved.environment_id, &source, facts)
                        .await
                    {
                        return Err(self.sink_failure(envelope, &err));
                    }
                }
                Findings::Problems(problems) => {
                    let mut groups: BTreeMap<String, Vec<Problem>> = BTreeMap::new();
                    for problem in problems {
                        groups.entry(problem.service.clone()).or_default().push(problem);
                    }
                    for (service, batch) in groups {
                        info!(
                            source,
                            service,
                            problems = batch.len(),
                            "writing problems"
                        );
                        if let Err(err) = self
                            .sink
                            .replace_problems(resolved.environment_id, &service, &source, batch)
                            .await
                        {
                            return Err(self.sink_failure(envelope, &err));
                        }
                    }
                }
            }

            if let Some(sbom) = sbom
                && let Some(queue) = &self.enrichment
            {
                if let Err(err) = queue
                    .enrich(resolved.environment_id, &resolved.service, sbom)
                    .await
                {
                    // Facts already written stay written; the envelope still
                    // fails, without a republish.
                    warn!(%err, "sbom enrichment failed");
                    return Err(Disposition::Reject);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Processor {
    async fn handle(&self, body: &[u8]) -> Disposition {
        let envelope: Envelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(%err, "dropping undecodable envelope");
                return Disposition::Ack;
            }
        };

        match envelope.message_type.as_deref() {
            Some("direct.facts") => {
                match direct::process_direct_facts(body, self.sink.as_ref()).await {
                    Ok(summary) => {
                        info!(summary, "processed direct facts");
                        Disposition::Ack
                    }
                    Err(err) => self.direct_failure(&envelope, err),
                }
            }
            Some("direct.problems") => {
                match direct::process_direct_problems(body, self.sink.as_ref()).await {
                    Ok(summaries) => {
                        info!(written = summaries.len(), "processed direct problems");
                        Disposition::Ack
                    }
                    Err(err) => self.direct_failure(&envelope, err),
                }
            }
            Some("direct.delete.facts") => {
                match direct::process_direct_delete_facts(body, self.sink.as_ref()).await {
                    Ok(summary) => {
                        info!(summary, "processed direct fact deletion");
                        Disposition::Ack
                    }
                    Err(err) => self.direct_failure(&envelope, err),
                }
            }
            Some("direct.delete.problems") => {
                match direct::process_direct_delete_problems(body, self.sink.as_ref()).await {
                    Ok(_) => Disposition::Ack,
                    Err(err) => self.direct_failure(&envelope, err),
                }
            }
            Some(unknown) => {
                warn!(message_type = unknown, "rejecting envelope with unknown direct type");
                Disposition::Reject
            }
            None => self.process_inferred(&envelope).await,
        }
    }
}
