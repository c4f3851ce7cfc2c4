// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use insights_api::{ApiClientConfig, LagoonApiClient, LagoonSink};
use insights_archive::{ArchiveConfig, Archiver};
use insights_broker::{BrokerConfig, Consumer};
use insights_config::{Settings, load_settings, validate_settings};
use insights_core::sink::FindingsSink;
use insights_enrich::{EnrichmentQueue, ScannerConfig, TrivyScanner};
use insights_handler::Processor;
use insights_mirror::MirrorStore;
use insights_pipeline::build_pipeline;
use insights_transform::FactTransformer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "insights-handler", version, about = "Insights ingestion handler")]
struct Args {
    /// Path to the TOML settings file.
    #[arg(long, env = "INSIGHTS_CONFIG")]
    config: Option<PathBuf>,

    /// The filter/transformers to load (JSON or YAML by extension).
    #[arg(long, env = "FILTER_TRANSFORMER_FILE")]
    filter_transformer_file: Option<PathBuf>,

    /// Disable uploading insights data to the object store.
    #[arg(long)]
    disable_s3_upload: bool,

    /// Disable insights data integration for the upstream API.
    #[arg(long)]
    disable_api_integration: bool,

    /// Disable the broker consumer.
    #[arg(long)]
    disable_broker_consumer: bool,

    /// Disable the mirror webservice.
    #[arg(long)]
    disable_webservice: bool,

    /// Derive problems from SBOM payloads via the trivy server.
    #[arg(long)]
    problems_from_sbom: bool,

    /// Remote trivy server location.
    #[arg(long, env = "TRIVY_SERVER_ENDPOINT")]
    trivy_server_location: Option<String>,

    /// Enable debugging output.
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Command-line flags win over the settings file.
    fn overlay(self, mut settings: Settings) -> Settings {
        if self.debug {
            settings.debug = true;
        }
        if self.disable_s3_upload {
            settings.s3.disabled = true;
        }
        if self.disable_api_integration {
            settings.api.disabled = true;
        }
        if self.disable_broker_consumer {
            settings.broker.disabled = true;
        }
        if self.disable_webservice {
            settings.mirror.disabled = true;
        }
        if self.problems_from_sbom {
            settings.enrichment.problems_from_sbom = true;
        }
        if let Some(server) = self.trivy_server_location {
            settings.enrichment.trivy_server = server;
        }
        if let Some(path) = self.filter_transformer_file {
            settings.transforms_file = Some(path);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();

    let settings = load_settings(config_path.as_deref()).context("loading settings")?;
    let settings = args.overlay(settings);

    insights_telemetry::init(settings.debug);

    for warning in validate_settings(&settings).context("validating settings")? {
        warn!(%warning, "settings warning");
    }

    let transformer = match &settings.transforms_file {
        Some(path) => {
            let transformer =
                FactTransformer::load(path).with_context(|| format!("loading {}", path.display()))?;
            info!(rules = transformer.len(), path = %path.display(), "registered fact transformers");
            transformer
        }
        None => FactTransformer::empty(),
    };
    let pipeline = build_pipeline(Arc::new(transformer));

    let api = Arc::new(LagoonApiClient::new(ApiClientConfig {
        endpoint: settings.api.endpoint.clone(),
        token_signing_key: settings.api.token_signing_key.clone(),
        audience: settings.api.jwt_audience.clone(),
        subject: settings.api.jwt_subject.clone(),
        issuer: settings.api.jwt_issuer.clone(),
        request_timeout: ApiClientConfig::DEFAULT_TIMEOUT,
    }));

    let mirror = if settings.mirror.disabled {
        None
    } else {
        let store = MirrorStore::connect(&settings.mirror.db_path)
            .await
            .context("opening mirror store")?;
        Some(Arc::new(store))
    };

    let sink: Arc<LagoonSink> = match &mirror {
        Some(store) => {
            let writer: Arc<dyn insights_core::sink::MirrorWriter> = store.clone();
            Arc::new(LagoonSink::with_mirror(api, writer))
        }
        None => Arc::new(LagoonSink::new(api)),
    };

    let shared_sink: Arc<dyn FindingsSink> = sink.clone();
    let mut processor =
        Processor::new(pipeline, shared_sink).with_api_disabled(settings.api.disabled);

    if !settings.s3.disabled {
        processor = processor.with_archiver(Archiver::new(&ArchiveConfig {
            endpoint: settings.s3.endpoint.clone(),
            access_key_id: settings.s3.access_key_id.clone(),
            secret_access_key: settings.s3.secret_access_key.clone(),
            bucket: settings.s3.bucket.clone(),
            region: settings.s3.region.clone(),
            use_tls: settings.s3.use_tls,
        }));
    }

    if settings.enrichment.problems_from_sbom {
        let scanner = TrivyScanner::new(ScannerConfig {
            server: settings.enrichment.trivy_server.clone(),
            scratch_dir: settings.enrichment.scratch_dir.clone(),
            timeout: Duration::from_secs(settings.enrichment.scan_timeout_secs),
        });
        let enrich_sink: Arc<dyn FindingsSink> = sink.clone();
        processor = processor.with_enrichment(EnrichmentQueue::start(scanner, enrich_sink));
    }

    let processor = Arc::new(processor);

    if let Some(store) = &mirror {
        let store = Arc::clone(store);
        let listen = settings.mirror.listen.clone();
        tokio::spawn(async move {
            if let Err(err) = insights_mirror::api::serve(store, &listen).await {
                warn!(%err, "mirror webservice stopped");
            }
        });
    }

    if settings.broker.disabled {
        info!("broker consumer disabled; waiting for shutdown");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        return Ok(());
    }

    let consumer = Consumer::new(BrokerConfig {
        dsn: settings.broker.amqp_dsn(),
        queue: settings.broker.queue.clone(),
        exchange: settings.broker.exchange.clone(),
        workers: settings.broker.workers,
        startup_attempts: settings.broker.startup_attempts,
        startup_interval: Duration::from_secs(settings.broker.startup_interval_secs),
    });

    info!(
        queue = %settings.broker.queue,
        workers = settings.broker.workers,
        "insights-handler running"
    );

    tokio::select! {
        result = consumer.run(processor) => result.context("broker consumer failed"),
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("shutting down");
            Ok(())
        }
    }
}
