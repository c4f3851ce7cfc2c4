// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-enrich
#![deny(unsafe_code)]
//!
//! SBOM → problems enrichment through an external trivy scanner.
//!
//! The scanner is health-checked before every scan, the BOM is staged to a
//! uniquely named scratch file that is removed on every exit path, and the
//! scan runs as a subprocess against the remote scanner with a wall-clock
//! timeout. A single background worker drains a FIFO queue so at most one
//! scan is in flight per scanner instance.

use insights_codec::cyclonedx::SbomDocument;
use insights_core::sink::{FindingsSink, SinkError};
use insights_core::{Problem, ProblemSeverity, TRIVY_PROBLEM_SOURCE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures along the enrichment path. None of these trigger a republish:
/// facts already written stay written, and the envelope is rejected.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// The scanner endpoint could not be reached at all.
    #[error("trivy server not reachable: {0}")]
    Unreachable(String),

    /// The scanner answered the health check with something other than
    /// `200 "ok"`.
    #[error("trivy server is not healthy")]
    Unhealthy,

    /// Staging the BOM to disk failed.
    #[error("unable to stage BOM scratch file: {0}")]
    Io(#[from] std::io::Error),

    /// Serialising the BOM failed.
    #[error(transparent)]
    Codec(#[from] insights_codec::CodecError),

    /// The scan exceeded its wall-clock budget.
    #[error("scanner timed out after {secs}s")]
    Timeout {
        /// Configured budget in seconds.
        secs: u64,
    },

    /// The scanner process exited unsuccessfully.
    #[error("scanner failed: {stderr}")]
    Scanner {
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The scanner's report was not the expected JSON shape.
    #[error("unable to parse scanner report: {0}")]
    Report(#[from] serde_json::Error),

    /// Writing the resulting problems upstream failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The enrichment worker has shut down.
    #[error("enrichment queue is closed")]
    QueueClosed,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Connection and staging parameters for the scanner.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Remote trivy server address (scheme included).
    pub server: String,
    /// Directory receiving scratch BOM files.
    pub scratch_dir: PathBuf,
    /// Wall-clock budget for one scan.
    pub timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            scratch_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(1000),
        }
    }
}

/// Client-side of the external trivy scanner.
#[derive(Debug, Clone)]
pub struct TrivyScanner {
    http: reqwest::Client,
    config: ScannerConfig,
    binary: PathBuf,
}

impl TrivyScanner {
    /// Build a scanner client.
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            binary: PathBuf::from("trivy"),
        }
    }

    /// Override the scanner binary (tests substitute a stub).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// `GET /healthz`, expecting `200` with body `ok`.
    ///
    /// # Errors
    ///
    /// [`EnrichError::Unreachable`] on transport failure. A reachable but
    /// unhealthy scanner returns `Ok(false)`.
    pub async fn is_alive(&self) -> Result<bool, EnrichError> {
        let url = format!("{}/healthz", self.config.server);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| EnrichError::Unreachable(e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Ok(false);
        }
        let body = response
            .text()
            .await
            .map_err(|e| EnrichError::Unreachable(e.to_string()))?;
        Ok(body == "ok")
    }

    /// Stage the BOM and run one scan, returning unstamped problems.
    ///
    /// # Errors
    ///
    /// Any [`EnrichError`] along the staging/exec/parse path.
    pub async fn scan(&self, sbom: &SbomDocument) -> Result<Vec<Problem>, EnrichError> {
        // The scratch file is uniquely named and removed on drop, which
        // covers every exit path below.
        let mut scratch = tempfile::Builder::new()
            .prefix("cyclonedx-")
            .suffix(".json")
            .tempfile_in(&self.config.scratch_dir)?;
        scratch.write_all(&sbom.to_bytes()?)?;
        scratch.flush()?;

        debug!(path = %scratch.path().display(), "staged BOM for scanning");

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("sbom")
            .arg("--format")
            .arg("json")
            .arg("--server")
            .arg(&self.config.server)
            .arg(scratch.path())
            // A timed-out scan must not leave the child running.
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| EnrichError::Timeout {
                secs: self.config.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(EnrichError::Scanner {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_report(&output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Report parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Default, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Default, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID", default)]
    vulnerability_id: String,
    #[serde(rename = "PkgName", default)]
    pkg_name: String,
    #[serde(rename = "InstalledVersion", default)]
    installed_version: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "References", default)]
    references: Vec<String>,
    #[serde(rename = "CVSS", default)]
    cvss: BTreeMap<String, CvssEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct CvssEntry {
    #[serde(rename = "V3Score", default)]
    v3_score: Option<f64>,
}

/// Normalise a scanner-reported score into `[0, 1]`: scores above 1 are
/// divided by 10 exactly once.
#[must_use]
pub fn normalize_severity_score(score: f64) -> f64 {
    if score > 1.0 { score / 10.0 } else { score }
}

impl TrivyVulnerability {
    /// Pick a CVSS v3 score, preferring the NVD entry, then the first vendor
    /// alphabetically (the map is ordered, so this is deterministic).
    fn score(&self) -> f64 {
        let picked = self
            .cvss
            .get("nvd")
            .and_then(|e| e.v3_score)
            .or_else(|| self.cvss.values().find_map(|e| e.v3_score));
        normalize_severity_score(picked.unwrap_or(0.0))
    }
}

/// Parse the scanner's JSON report into unstamped problems.
///
/// # Errors
///
/// [`EnrichError::Report`] when the bytes are not a trivy report.
pub fn parse_report(bytes: &[u8]) -> Result<Vec<Problem>, EnrichError> {
    let report: TrivyReport = serde_json::from_slice(bytes)?;

    let mut problems = Vec::new();
    for result in report.results {
        for vulnerability in result.vulnerabilities {
            problems.push(Problem {
                identifier: vulnerability.vulnerability_id.clone(),
                version: vulnerability.installed_version.clone(),
                fixed_version: vulnerability.fixed_version.clone(),
                data: "{}".into(),
                severity: ProblemSeverity::from_label(&vulnerability.severity),
                severity_score: vulnerability.score(),
                associated_package: vulnerability.pkg_name.clone(),
                description: vulnerability.description.clone(),
                links: vulnerability.references.first().cloned().unwrap_or_default(),
                ..Default::default()
            });
        }
    }
    Ok(problems)
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Health-check, scan, stamp, and write problems for one BOM.
///
/// # Errors
///
/// Any [`EnrichError`]; callers treat all of them as non-republishable.
pub async fn enrich_sbom(
    sink: &dyn FindingsSink,
    scanner: &TrivyScanner,
    environment: i64,
    service: &str,
    sbom: &SbomDocument,
) -> Result<Vec<String>, EnrichError> {
    if !scanner.is_alive().await? {
        return Err(EnrichError::Unhealthy);
    }
    debug!("trivy is reachable");

    let mut problems = scanner.scan(sbom).await?;
    for problem in &mut problems {
        problem.environment = environment;
        problem.service = service.to_string();
        problem.source = TRIVY_PROBLEM_SOURCE.to_string();
    }

    info!(
        environment,
        service,
        problems = problems.len(),
        "scanned BOM"
    );

    Ok(sink
        .replace_problems(environment, service, TRIVY_PROBLEM_SOURCE, problems)
        .await?)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct EnrichmentJob {
    environment: i64,
    service: String,
    sbom: SbomDocument,
    reply: oneshot::Sender<Result<Vec<String>, EnrichError>>,
}

/// FIFO enrichment queue with a single worker, so scanner load is bounded to
/// one scan in flight. Waking is channel-driven; there is no polling loop.
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentJob>,
}

impl EnrichmentQueue {
    /// Spawn the worker and hand back the queue handle.
    pub fn start(scanner: TrivyScanner, sink: Arc<dyn FindingsSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<EnrichmentJob>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = enrich_sbom(
                    sink.as_ref(),
                    &scanner,
                    job.environment,
                    &job.service,
                    &job.sbom,
                )
                .await;
                if let Err(err) = &result {
                    warn!(environment = job.environment, service = %job.service, %err, "enrichment failed");
                }
                // The submitter may have given up; that is not an error here.
                let _ = job.reply.send(result);
            }
        });
        Self { tx }
    }

    /// Enqueue one BOM and wait for its enrichment to complete.
    ///
    /// # Errors
    ///
    /// [`EnrichError::QueueClosed`] when the worker is gone, otherwise
    /// whatever the enrichment itself produced.
    pub async fn enrich(
        &self,
        environment: i64,
        service: &str,
        sbom: SbomDocument,
    ) -> Result<Vec<String>, EnrichError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(EnrichmentJob {
                environment,
                service: service.to_string(),
                sbom,
                reply,
            })
            .await
            .map_err(|_| EnrichError::QueueClosed)?;
        response.await.map_err(|_| EnrichError::QueueClosed)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use insights_core::{Fact, ResolvedTarget, ResourceTarget};
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPORT: &str = r#"{
        "Results": [{
            "Vulnerabilities": [{
                "VulnerabilityID": "CVE-2024-0001",
                "PkgName": "npm-foo",
                "InstalledVersion": "1.0",
                "FixedVersion": "1.0.1",
                "Severity": "HIGH",
                "Description": "Something bad",
                "References": ["https://example.com/CVE-2024-0001", "https://other"],
                "CVSS": {"nvd": {"V3Score": 7.5}}
            }]
        }]
    }"#;

    // -- 1. Severity score normalisation (divide once, only above 1) -----------

    #[test]
    fn severity_scores_normalise_once() {
        assert_eq!(normalize_severity_score(7.5), 0.75);
        assert_eq!(normalize_severity_score(0.4), 0.4);
        assert_eq!(normalize_severity_score(0.0), 0.0);
        assert_eq!(normalize_severity_score(1.0), 1.0);
        assert_eq!(normalize_severity_score(10.0), 1.0);
    }

    // -- 2. Report parsing maps every field -------------------------------------

    #[test]
    fn report_parsing_maps_fields() {
        let problems = parse_report(REPORT.as_bytes()).unwrap();
        assert_eq!(problems.len(), 1);
        let p = &problems[0];
        assert_eq!(p.identifier, "CVE-2024-0001");
        assert_eq!(p.associated_package, "npm-foo");
        assert_eq!(p.version, "1.0");
        assert_eq!(p.fixed_version, "1.0.1");
        assert_eq!(p.severity, ProblemSeverity::High);
        assert_eq!(p.severity_score, 0.75);
        assert_eq!(p.links, "https://example.com/CVE-2024-0001");
        assert_eq!(p.data, "{}");
    }

    // -- 3. Reports without vulnerabilities parse to nothing ---------------------

    #[test]
    fn empty_report_parses_to_no_problems() {
        assert!(parse_report(b"{}").unwrap().is_empty());
        assert!(parse_report(br#"{"Results": [{}]}"#).unwrap().is_empty());
    }

    // -- 4. Garbage reports error -------------------------------------------------

    #[test]
    fn garbage_report_is_an_error() {
        assert!(matches!(
            parse_report(b"gibberish").unwrap_err(),
            EnrichError::Report(_)
        ));
    }

    // -- 5. Health check semantics --------------------------------------------------

    #[tokio::test]
    async fn health_check_requires_200_ok_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let scanner = TrivyScanner::new(ScannerConfig {
            server: server.uri(),
            ..Default::default()
        });
        assert!(scanner.is_alive().await.unwrap());
    }

    #[tokio::test]
    async fn health_check_rejects_wrong_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("almost ok"))
            .mount(&server)
            .await;
        let scanner = TrivyScanner::new(ScannerConfig {
            server: server.uri(),
            ..Default::default()
        });
        assert!(!scanner.is_alive().await.unwrap());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let scanner = TrivyScanner::new(ScannerConfig {
            server: server.uri(),
            ..Default::default()
        });
        assert!(!scanner.is_alive().await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_scanner_is_a_transport_error() {
        let scanner = TrivyScanner::new(ScannerConfig {
            server: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        assert!(matches!(
            scanner.is_alive().await.unwrap_err(),
            EnrichError::Unreachable(_)
        ));
    }

    // -- 6. A stub scanner binary exercises the full scan path ---------------------

    #[cfg(unix)]
    #[tokio::test]
    async fn scan_runs_the_binary_and_parses_stdout() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");
        std::fs::write(&report_path, REPORT).unwrap();

        let stub = dir.path().join("trivy-stub.sh");
        std::fs::write(&stub, format!("#!/bin/sh\ncat {}\n", report_path.display())).unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scanner = TrivyScanner::new(ScannerConfig {
            server: "http://trivy.local".into(),
            scratch_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(10),
        })
        .with_binary(&stub);

        let sbom = SbomDocument::from_value(serde_json::json!({"bomFormat": "CycloneDX"}));
        let problems = scanner.scan(&sbom).await.unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].identifier, "CVE-2024-0001");

        // The scratch file must be gone once the scan returns.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("cyclonedx-"))
            .collect();
        assert!(leftovers.is_empty(), "scratch files must be cleaned up");
    }

    // -- 7. Unhealthy scanners stop enrichment before any sink call ----------------

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FindingsSink for RecordingSink {
        async fn resolve(&self, _t: &ResourceTarget) -> Result<ResolvedTarget, SinkError> {
            unimplemented!("not used here")
        }

        async fn replace_facts(
            &self,
            _environment: i64,
            _source: &str,
            _facts: Vec<Fact>,
        ) -> Result<String, SinkError> {
            unimplemented!("not used here")
        }

        async fn replace_problems(
            &self,
            environment: i64,
            service: &str,
            source: &str,
            problems: Vec<Problem>,
        ) -> Result<Vec<String>, SinkError> {
            self.calls.lock().unwrap().push(format!(
                "replaceProblems:{environment}:{service}:{source}:{}",
                problems.len()
            ));
            Ok(vec![])
        }

        async fn delete_facts(&self, _e: i64, _s: &str) -> Result<i64, SinkError> {
            unimplemented!("not used here")
        }

        async fn delete_problems(
            &self,
            _e: i64,
            _service: &str,
            _source: &str,
        ) -> Result<String, SinkError> {
            unimplemented!("not used here")
        }
    }

    #[tokio::test]
    async fn unhealthy_scanner_fails_before_sink_writes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = RecordingSink::default();
        let scanner = TrivyScanner::new(ScannerConfig {
            server: server.uri(),
            ..Default::default()
        });
        let sbom = SbomDocument::from_value(serde_json::json!({}));

        let err = enrich_sbom(&sink, &scanner, 3, "cli", &sbom)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::Unhealthy));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    // -- 8. The queue round-trips results from the worker ---------------------------

    #[cfg(unix)]
    #[tokio::test]
    async fn queue_round_trips_results() {
        use std::os::unix::fs::PermissionsExt as _;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");
        std::fs::write(&report_path, REPORT).unwrap();
        let stub = dir.path().join("trivy-stub.sh");
        std::fs::write(&stub, format!("#!/bin/sh\ncat {}\n", report_path.display())).unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scanner = TrivyScanner::new(ScannerConfig {
            server: server.uri(),
            scratch_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(10),
        })
        .with_binary(&stub);

        let sink = Arc::new(RecordingSink::default());
        let queue = EnrichmentQueue::start(scanner, sink.clone());

        let sbom = SbomDocument::from_value(serde_json::json!({"bomFormat": "CycloneDX"}));
        queue.enrich(3, "cli", sbom).await.unwrap();

        let calls = sink.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["replaceProblems:3:cli:insights-handler-trivy:1"]);
    }
}
