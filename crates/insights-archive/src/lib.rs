// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-archive
#![deny(unsafe_code)]
//!
//! Uploads raw envelope payloads to an S3-compatible object store under a
//! deterministic, lowercased key. Non-direct envelopes only; the dispatcher
//! never archives typed direct messages.

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use insights_codec::decode_binary_json;
use insights_core::Envelope;
use insights_core::classify::{InsightsDescriptor, PayloadShape};
use insights_core::ResourceTarget;
use std::io::Write as _;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures along the archive path. The dispatcher treats all of them as
/// transient (object stores come back).
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Bucket creation or upload failed.
    #[error("object store error: {0}")]
    Store(String),

    /// The payload could not be decoded for re-encoding.
    #[error(transparent)]
    Codec(#[from] insights_codec::CodecError),

    /// Serialising the envelope or payload failed.
    #[error("unable to serialise payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Staging the upload to a scratch file failed.
    #[error("unable to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection parameters for the object store.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Endpoint, with or without a scheme (the scheme is derived from
    /// `use_tls` either way).
    pub endpoint: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Target bucket; created if missing.
    pub bucket: String,
    /// Region (may be empty for MinIO-style stores).
    pub region: String,
    /// TLS toggle.
    pub use_tls: bool,
}

impl ArchiveConfig {
    /// The endpoint as a full URL, scheme chosen by `use_tls`.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint);
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{host}")
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive the deterministic object key for an envelope's archived payload:
/// `insights/<project>/<environment>/<kind>-<project>-<environment>-<service>.<ext>[.gz]`,
/// lowercased.
#[must_use]
pub fn object_key(descriptor: &InsightsDescriptor, target: &ResourceTarget) -> String {
    let mut ext = descriptor.output_ext.clone();
    if descriptor.output_compressed {
        ext = format!("{ext}.gz");
    }
    format!(
        "insights/{project}/{environment}/{kind}-{project}-{environment}-{service}.{ext}",
        project = target.project,
        environment = target.environment,
        kind = descriptor.kind,
        service = target.service,
    )
    .to_lowercase()
}

/// Render one decoded binary payload for upload: pretty JSON, gzipped when
/// the descriptor asks for compressed output.
///
/// # Errors
///
/// [`ArchiveError::Json`] or [`ArchiveError::Codec`].
pub fn render_binary_object(
    value: &serde_json::Value,
    compressed: bool,
) -> Result<Vec<u8>, ArchiveError> {
    let pretty = serde_json::to_vec_pretty(value)?;
    if compressed {
        Ok(insights_codec::gzip_bytes(&pretty)?)
    } else {
        Ok(pretty)
    }
}

// ---------------------------------------------------------------------------
// Archiver
// ---------------------------------------------------------------------------

/// The S3-compatible archiver.
#[derive(Debug, Clone)]
pub struct Archiver {
    client: Client,
    bucket: String,
}

impl Archiver {
    /// Build an archiver from static credentials.
    #[must_use]
    pub fn new(config: &ArchiveConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "insights-archive",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint_url())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Create the bucket, tolerating "already exists / already owned".
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Store`] for any other store failure.
    pub async fn ensure_bucket(&self) -> Result<(), ArchiveError> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "created archive bucket");
                Ok(())
            }
            Err(err) => {
                let already_there = err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if already_there {
                    Ok(())
                } else {
                    Err(ArchiveError::Store(err.to_string()))
                }
            }
        }
    }

    /// Upload an envelope's payload(s) under the deterministic key.
    ///
    /// JSON-shaped envelopes are archived whole; binary payloads are decoded
    /// and re-encoded as pretty JSON, optionally re-gzipped, staged through a
    /// scratch file that is removed afterwards.
    ///
    /// # Errors
    ///
    /// Any [`ArchiveError`].
    pub async fn archive(
        &self,
        envelope: &Envelope,
        descriptor: &InsightsDescriptor,
        target: &ResourceTarget,
    ) -> Result<(), ArchiveError> {
        self.ensure_bucket().await?;

        let key = object_key(descriptor, target);

        match descriptor.payload_shape {
            PayloadShape::Json => {
                let body = serde_json::to_vec(envelope)?;
                let size = body.len();
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(body))
                    .content_type("application/json")
                    .send()
                    .await
                    .map_err(|e| ArchiveError::Store(e.to_string()))?;
                info!(key, size, "archived envelope");
            }
            PayloadShape::Binary => {
                for encoded in envelope.binary_payload.iter().flatten().map(|(_, v)| v) {
                    let decoded = decode_binary_json(encoded)?;
                    let body = render_binary_object(&decoded, descriptor.output_compressed)?;
                    let size = body.len();

                    // Staged through a scratch file, mirroring how oversized
                    // payloads are handed to the store; the file is removed
                    // when `scratch` drops.
                    let mut scratch = tempfile::NamedTempFile::new()?;
                    scratch.write_all(&body)?;
                    scratch.flush()?;
                    let stream = ByteStream::from_path(scratch.path())
                        .await
                        .map_err(|e| ArchiveError::Store(e.to_string()))?;

                    let mut put = self
                        .client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(&key)
                        .body(stream)
                        .content_type(&descriptor.output_mime);
                    if descriptor.output_compressed {
                        put = put.content_encoding("gzip");
                    }
                    put.send()
                        .await
                        .map_err(|e| ArchiveError::Store(e.to_string()))?;

                    debug!(key, size, "archived binary payload");
                }
                info!(key, "archived payloads");
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
