use crate::config::S3Config;
use crate::error::GatewayError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// One stored object referenced by an ECG record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub storage_key: String,
    pub retrieval_url: String,
    pub bucket: String,
    pub size_bytes: i64,
    pub content_type: String,
}

/// Metadata echoed into each stored object's tags.
#[derive(Debug, Clone, Default)]
pub struct ArtifactTags {
    pub device_id: String,
    pub patient_id: String,
    pub session_id: String,
    pub recording_date: String,
}

/// Artifact type tag used in storage keys and content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Json,
    Pdf,
}

impl ArtifactKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ArtifactKind::Json => "json",
            ArtifactKind::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Json => "application/json",
            ArtifactKind::Pdf => "application/pdf",
        }
    }
}

/// Generate the storage key for one artifact.
/// Format: `ecg/{date}/{device_id}/{timestamp}_{kind}.{ext}`
///
/// Partitioned by date then device for time-based queries and lifecycle
/// policies; unique per (device, artifact-type, timestamp) and independent
/// of record-store ids, since artifacts are created before the record.
pub fn artifact_key(device_id: &str, kind: ArtifactKind, timestamp: DateTime<Utc>) -> String {
    let date = timestamp.format("%Y-%m-%d").to_string();
    let time = timestamp.format("%H%M%S%3f").to_string();

    format!(
        "ecg/{date}/{device_id}/{time}_{tag}.{ext}",
        date = date,
        device_id = sanitize_path_component(device_id),
        time = time,
        tag = kind.tag(),
        ext = kind.tag()
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Object-store seam: content-addressed puts and time-limited read URLs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        tags: &ArtifactTags,
    ) -> Result<StoredArtifact, GatewayError>;

    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, GatewayError>;
}

/// S3-backed artifact store.
pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
}

impl S3ArtifactStore {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let s3_config = s3_config_builder.build();
        let client = S3Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 artifact store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    /// Stable (non-presigned) object URL recorded on the ECG record.
    fn object_url(&self, key: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    #[instrument(skip(self, bytes, tags), fields(size_bytes = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        tags: &ArtifactTags,
    ) -> Result<StoredArtifact, GatewayError> {
        let size_bytes = bytes.len() as i64;
        let body = ByteStream::from(bytes);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .metadata("device-id", &tags.device_id)
            .metadata("patient-id", &tags.patient_id)
            .metadata("session-id", &tags.session_id)
            .metadata("recording-date", &tags.recording_date)
            .send()
            .await
            .map_err(|e| GatewayError::ArtifactUpload(e.to_string()))?;

        debug!(key = %key, "Artifact uploaded");
        metrics::counter!("gateway.ecg.artifacts_uploaded").increment(1);

        Ok(StoredArtifact {
            storage_key: key.to_string(),
            retrieval_url: self.object_url(key),
            bucket: self.bucket.clone(),
            size_bytes,
            content_type: content_type.to_string(),
        })
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, GatewayError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e).context("Invalid presign expiry")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                GatewayError::Internal(
                    anyhow::anyhow!(e.to_string()).context("Failed to generate presigned URL"),
                )
            })?;

        Ok(presigned.uri().to_string())
    }
}
