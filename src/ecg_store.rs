use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Processing status of an ECG record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcgStatus {
    Uploaded,
    Processed,
    Analyzed,
    Error,
}

impl EcgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EcgStatus::Uploaded => "uploaded",
            EcgStatus::Processed => "processed",
            EcgStatus::Analyzed => "analyzed",
            EcgStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(EcgStatus::Uploaded),
            "processed" => Some(EcgStatus::Processed),
            "analyzed" => Some(EcgStatus::Analyzed),
            "error" => Some(EcgStatus::Error),
            _ => None,
        }
    }
}

/// Origin of an ECG submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Software,
    Api,
    Webhook,
    Direct,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Software => "software",
            DataSource::Api => "api",
            DataSource::Webhook => "webhook",
            DataSource::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "software" => Some(DataSource::Software),
            "api" => Some(DataSource::Api),
            "webhook" => Some(DataSource::Webhook),
            "direct" => Some(DataSource::Direct),
            _ => None,
        }
    }
}

/// Input for composing a new ECG record. Both artifacts must already be
/// stored: a record is only created after both uploads succeed.
#[derive(Debug, Clone)]
pub struct NewEcgRecord {
    pub device_id: String,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub structured_payload: serde_json::Value,
    pub json_storage_key: String,
    pub json_url: String,
    pub json_size_bytes: i64,
    pub pdf_storage_key: String,
    pub pdf_url: String,
    pub pdf_size_bytes: i64,
    pub bucket: String,
    pub recording_date: DateTime<Utc>,
    pub recording_duration_secs: Option<f64>,
    pub sample_rate_hz: Option<f64>,
    pub leads: Vec<String>,
    pub status: EcgStatus,
    pub data_source: DataSource,
    pub linked_device_id: Option<String>,
    pub linked_device_family: Option<String>,
}

/// Full ECG record, including the structured payload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EcgRecord {
    pub id: Uuid,
    pub device_id: String,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub structured_payload: serde_json::Value,
    pub json_storage_key: String,
    pub json_url: String,
    pub json_size_bytes: i64,
    pub pdf_storage_key: String,
    pub pdf_url: String,
    pub pdf_size_bytes: i64,
    pub bucket: String,
    pub recording_date: DateTime<Utc>,
    pub recording_duration_secs: Option<f64>,
    pub sample_rate_hz: Option<f64>,
    pub leads: Vec<String>,
    pub status: String,
    pub data_source: String,
    pub linked_device_id: Option<String>,
    pub linked_device_family: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// List-view projection: everything except the structured payload, which
/// can be large and is only returned on single-record fetch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EcgListItem {
    pub id: Uuid,
    pub device_id: String,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub json_storage_key: String,
    pub json_url: String,
    pub json_size_bytes: i64,
    pub pdf_storage_key: String,
    pub pdf_url: String,
    pub pdf_size_bytes: i64,
    pub bucket: String,
    pub recording_date: DateTime<Utc>,
    pub recording_duration_secs: Option<f64>,
    pub sample_rate_hz: Option<f64>,
    pub leads: Vec<String>,
    pub status: String,
    pub data_source: String,
    pub received_at: DateTime<Utc>,
}

/// Query parameters for ECG record search. Date bounds are inclusive and
/// independently optional.
#[derive(Debug, Clone)]
pub struct EcgQuery {
    pub device_id: Option<String>,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EcgQuery {
    fn default() -> Self {
        Self {
            device_id: None,
            patient_id: None,
            session_id: None,
            status: None,
            start_date: None,
            end_date: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Durable store for ECG records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EcgStore: Send + Sync {
    async fn insert(&self, record: NewEcgRecord) -> Result<EcgRecord, GatewayError>;

    async fn get(&self, id: Uuid) -> Result<Option<EcgRecord>, GatewayError>;

    async fn query(&self, query: &EcgQuery) -> Result<Vec<EcgListItem>, GatewayError>;

    async fn count(&self, query: &EcgQuery) -> Result<i64, GatewayError>;
}

/// PostgreSQL-backed ECG record store.
pub struct PgEcgStore {
    pool: PgPool,
}

const LIST_COLUMNS: &str = r#"id, device_id, patient_id, session_id,
       json_storage_key, json_url, json_size_bytes,
       pdf_storage_key, pdf_url, pdf_size_bytes, bucket,
       recording_date, recording_duration_secs, sample_rate_hz, leads,
       status, data_source, received_at"#;

const FULL_COLUMNS: &str = r#"id, device_id, patient_id, session_id, structured_payload,
       json_storage_key, json_url, json_size_bytes,
       pdf_storage_key, pdf_url, pdf_size_bytes, bucket,
       recording_date, recording_duration_secs, sample_rate_hz, leads,
       status, data_source, linked_device_id, linked_device_family, received_at"#;

impl PgEcgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EcgStore for PgEcgStore {
    #[instrument(skip(self, record), fields(device_id = %record.device_id))]
    async fn insert(&self, record: NewEcgRecord) -> Result<EcgRecord, GatewayError> {
        let id = Uuid::new_v4();

        let stored = sqlx::query_as::<_, EcgRecord>(&format!(
            r#"
            INSERT INTO ecg_records (
                id, device_id, patient_id, session_id, structured_payload,
                json_storage_key, json_url, json_size_bytes,
                pdf_storage_key, pdf_url, pdf_size_bytes, bucket,
                recording_date, recording_duration_secs, sample_rate_hz, leads,
                status, data_source, linked_device_id, linked_device_family, received_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8,
                $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20, NOW()
            )
            RETURNING {FULL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&record.device_id)
        .bind(&record.patient_id)
        .bind(&record.session_id)
        .bind(&record.structured_payload)
        .bind(&record.json_storage_key)
        .bind(&record.json_url)
        .bind(record.json_size_bytes)
        .bind(&record.pdf_storage_key)
        .bind(&record.pdf_url)
        .bind(record.pdf_size_bytes)
        .bind(&record.bucket)
        .bind(record.recording_date)
        .bind(record.recording_duration_secs)
        .bind(record.sample_rate_hz)
        .bind(&record.leads)
        .bind(record.status.as_str())
        .bind(record.data_source.as_str())
        .bind(&record.linked_device_id)
        .bind(&record.linked_device_family)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to insert ECG record"))
        })?;

        debug!(record_id = %stored.id, "ECG record stored");
        metrics::counter!("gateway.ecg.records_created").increment(1);

        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EcgRecord>, GatewayError> {
        sqlx::query_as::<_, EcgRecord>(&format!(
            "SELECT {FULL_COLUMNS} FROM ecg_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to query ECG record"))
        })
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &EcgQuery) -> Result<Vec<EcgListItem>, GatewayError> {
        let mut sql = format!("SELECT {LIST_COLUMNS} FROM ecg_records WHERE 1=1");
        let mut param_count = 0;

        if query.device_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND device_id = ${param_count}"));
        }
        if query.patient_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND patient_id = ${param_count}"));
        }
        if query.session_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND session_id = ${param_count}"));
        }
        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.start_date.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recording_date >= ${param_count}"));
        }
        if query.end_date.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recording_date <= ${param_count}"));
        }

        sql.push_str(" ORDER BY received_at DESC");

        param_count += 1;
        sql.push_str(&format!(" LIMIT ${param_count}"));
        param_count += 1;
        sql.push_str(&format!(" OFFSET ${param_count}"));

        let mut query_builder = sqlx::query_as::<_, EcgListItem>(&sql);

        if let Some(ref device_id) = query.device_id {
            query_builder = query_builder.bind(device_id);
        }
        if let Some(ref patient_id) = query.patient_id {
            query_builder = query_builder.bind(patient_id);
        }
        if let Some(ref session_id) = query.session_id {
            query_builder = query_builder.bind(session_id);
        }
        if let Some(ref status) = query.status {
            query_builder = query_builder.bind(status);
        }
        if let Some(start_date) = query.start_date {
            query_builder = query_builder.bind(start_date);
        }
        if let Some(end_date) = query.end_date {
            query_builder = query_builder.bind(end_date);
        }
        query_builder = query_builder.bind(query.limit).bind(query.offset);

        query_builder.fetch_all(&self.pool).await.map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to query ECG records"))
        })
    }

    async fn count(&self, query: &EcgQuery) -> Result<i64, GatewayError> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM ecg_records
            WHERE ($1::text IS NULL OR device_id = $1)
              AND ($2::text IS NULL OR patient_id = $2)
              AND ($3::text IS NULL OR session_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR recording_date >= $5)
              AND ($6::timestamptz IS NULL OR recording_date <= $6)
            "#,
        )
        .bind(&query.device_id)
        .bind(&query.patient_id)
        .bind(&query.session_id)
        .bind(&query.status)
        .bind(query.start_date)
        .bind(query.end_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to count ECG records"))
        })?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in ["uploaded", "processed", "analyzed", "error"] {
            assert_eq!(EcgStatus::parse(status).unwrap().as_str(), status);
        }
        assert_eq!(EcgStatus::parse("pending"), None);
    }

    #[test]
    fn test_data_source_round_trip() {
        for source in ["software", "api", "webhook", "direct"] {
            assert_eq!(DataSource::parse(source).unwrap().as_str(), source);
        }
        assert_eq!(DataSource::parse("mobile"), None);
    }

    #[test]
    fn test_query_defaults() {
        let query = EcgQuery::default();
        assert_eq!(query.limit, 100);
        assert_eq!(query.offset, 0);
        assert!(query.device_id.is_none());
    }
}
