use crate::classifier::DeviceFamily;
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// One inbound telemetry event, ready for persistence.
#[derive(Debug, Clone)]
pub struct NewTelemetryEvent {
    pub device_family: DeviceFamily,
    pub device_id: String,
    pub device_status: i64,
    /// Raw device data, preserved verbatim for audit and replay.
    pub raw_payload: String,
    pub decoded_fields: serde_json::Map<String, serde_json::Value>,
}

/// Persisted telemetry event. Append-only: one row per inbound event,
/// `raw_payload` never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredTelemetryEvent {
    pub id: Uuid,
    pub device_family: String,
    pub device_id: String,
    pub device_status: i64,
    pub raw_payload: String,
    pub decoded_fields: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Configuration change queued for a device, delivered opportunistically
/// on next contact. The gateway only reads this table; creation and
/// clearing belong to the device-configuration component.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingDeviceConfig {
    pub device_id: String,
    pub config_values: serde_json::Value,
    pub pending_update: bool,
}

/// Durable store for telemetry events and pending-config lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_event(
        &self,
        event: NewTelemetryEvent,
    ) -> Result<StoredTelemetryEvent, GatewayError>;

    async fn find_pending_config(
        &self,
        device_id: &str,
    ) -> Result<Option<PendingDeviceConfig>, GatewayError>;

    async fn list_device_events(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredTelemetryEvent>, GatewayError>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<(), GatewayError>;
}

/// PostgreSQL-backed telemetry store.
pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_insert(&self, event: &NewTelemetryEvent) -> Result<StoredTelemetryEvent, sqlx::Error> {
        let id = Uuid::new_v4();
        let decoded = serde_json::Value::Object(event.decoded_fields.clone());

        sqlx::query_as::<_, StoredTelemetryEvent>(
            r#"
            INSERT INTO device_telemetry (
                id, device_family, device_id, device_status,
                raw_payload, decoded_fields, received_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW()
            )
            RETURNING id, device_family, device_id, device_status,
                      raw_payload, decoded_fields, received_at
            "#,
        )
        .bind(id)
        .bind(event.device_family.as_str())
        .bind(&event.device_id)
        .bind(event.device_status)
        .bind(&event.raw_payload)
        .bind(&decoded)
        .fetch_one(&self.pool)
        .await
    }
}

/// Connection-level failures, distinct from constraint or query errors.
/// These get exactly one retry before surfacing as `StoreUnavailable`.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
    )
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    #[instrument(skip(self, event), fields(device_id = %event.device_id, family = %event.device_family))]
    async fn insert_event(
        &self,
        event: NewTelemetryEvent,
    ) -> Result<StoredTelemetryEvent, GatewayError> {
        let stored = match self.try_insert(&event).await {
            Ok(stored) => stored,
            Err(e) if is_connection_error(&e) => {
                warn!(error = %e, "Telemetry insert hit a connection error, retrying once");
                self.try_insert(&event).await.map_err(|e| {
                    if is_connection_error(&e) {
                        GatewayError::StoreUnavailable
                    } else {
                        GatewayError::Internal(
                            anyhow::Error::new(e).context("Failed to insert telemetry event"),
                        )
                    }
                })?
            }
            Err(e) => {
                return Err(GatewayError::Internal(
                    anyhow::Error::new(e).context("Failed to insert telemetry event"),
                ))
            }
        };

        debug!(event_id = %stored.id, "Telemetry event stored");
        metrics::counter!("gateway.telemetry.events_stored").increment(1);

        Ok(stored)
    }

    async fn find_pending_config(
        &self,
        device_id: &str,
    ) -> Result<Option<PendingDeviceConfig>, GatewayError> {
        sqlx::query_as::<_, PendingDeviceConfig>(
            r#"
            SELECT device_id, config_values, pending_update
            FROM device_configs
            WHERE device_id = $1 AND pending_update = TRUE
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to query pending config"))
        })
    }

    async fn list_device_events(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredTelemetryEvent>, GatewayError> {
        sqlx::query_as::<_, StoredTelemetryEvent>(
            r#"
            SELECT id, device_family, device_id, device_status,
                   raw_payload, decoded_fields, received_at
            FROM device_telemetry
            WHERE device_id = $1
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::Error::new(e).context("Failed to query device events"))
        })
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::StoreUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_classified() {
        assert!(is_connection_error(&sqlx::Error::PoolTimedOut));
        assert!(is_connection_error(&sqlx::Error::PoolClosed));
        assert!(!is_connection_error(&sqlx::Error::RowNotFound));
    }
}
