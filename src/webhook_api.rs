use crate::classifier::{self, Classification};
use crate::envelope::{self, TelemetryEnvelope};
use crate::error::{error_response, GatewayError};
use crate::server::AppState;
use crate::telemetry_store::NewTelemetryEvent;
use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/telemetry/webhook",
            get(confirm_destination).post(receive_telemetry),
        )
        .route(
            "/telemetry/devices/:device_id/events",
            get(list_device_events),
        )
}

/// Successful ingestion response.
#[derive(Debug, Serialize)]
pub struct TelemetryIngestResponse {
    pub success: bool,
    pub message: String,
    pub data: TelemetryIngestData,
    pub config_update: ConfigUpdateStatus,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct TelemetryIngestData {
    pub device_id: String,
    pub received_at: DateTime<Utc>,
}

/// Outcome of the config-push side channel for this event.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfigUpdateStatus {
    /// A pending configuration exists for this device.
    pub available: bool,
    /// The pending configuration was delivered to the reply channel.
    pub published: bool,
}

/// Destination-ownership confirmation handshake. The managed bus probes
/// the endpoint with a GET carrying query parameters; echo them back.
async fn confirm_destination(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    info!(?params, "Bus destination confirmation request received");

    Json(serde_json::json!({
        "success": true,
        "message": "IoT destination confirmed",
        "endpoint": "/telemetry/webhook",
        "params": params,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Webhook endpoint receiving device telemetry from the managed bus.
async fn receive_telemetry(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request_id = Uuid::new_v4();

    match ingest(&state, body, request_id).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            match &e {
                GatewayError::Validation(_) | GatewayError::Decode(_) => {
                    warn!(request_id = %request_id, error = %e, "Telemetry request rejected")
                }
                _ => error!(request_id = %request_id, error = %e, "Telemetry ingestion failed"),
            }
            error_response(&e, Some(request_id))
        }
    }
}

/// Ingestion sequence: normalize, classify, decode, persist, then the
/// best-effort config-push and acknowledgment side channels.
#[instrument(skip_all, fields(request_id = %request_id))]
async fn ingest(
    state: &AppState,
    body: Value,
    request_id: Uuid,
) -> Result<TelemetryIngestResponse, GatewayError> {
    let envelope = envelope::normalize(body)?;
    let classification = classifier::classify(&envelope);

    info!(
        device_id = %classification.device_id,
        family = %classification.family,
        topic = envelope.routing_topic.as_deref().unwrap_or("-"),
        "Received telemetry event"
    );

    let decoded = state
        .decoder
        .decode(&envelope.raw_device_data, classification.family)?;

    let stored = state
        .telemetry_store
        .insert_event(NewTelemetryEvent {
            device_family: classification.family,
            device_id: classification.device_id.clone(),
            device_status: envelope.device_status,
            raw_payload: envelope.raw_device_data.clone(),
            decoded_fields: decoded,
        })
        .await?;

    let config_update = push_pending_config(state, &envelope, &classification).await?;
    publish_acknowledgment(state, &envelope, &classification.device_id).await;

    Ok(TelemetryIngestResponse {
        success: true,
        message: "Telemetry received and processed successfully".to_string(),
        data: TelemetryIngestData {
            device_id: classification.device_id,
            received_at: stored.received_at,
        },
        config_update,
        request_id,
    })
}

/// Push-on-contact config delivery: at most one publish per telemetry
/// event. Publish failures never fail the request — the telemetry is
/// already durably recorded and delivery confirmation is handled
/// out-of-band.
async fn push_pending_config(
    state: &AppState,
    envelope: &TelemetryEnvelope,
    classification: &Classification,
) -> Result<ConfigUpdateStatus, GatewayError> {
    let Some(config) = state
        .telemetry_store
        .find_pending_config(&classification.device_id)
        .await?
    else {
        return Ok(ConfigUpdateStatus::default());
    };

    let Some(publisher) = &state.publisher else {
        info!(
            device_id = %classification.device_id,
            "Pending config found but no message bus configured, skipping push"
        );
        return Ok(ConfigUpdateStatus {
            available: true,
            published: false,
        });
    };

    let channel = classifier::reply_channel(
        envelope.routing_topic.as_deref(),
        &classification.device_id,
    );
    let payload = serde_json::to_vec(&serde_json::json!({
        "device_id": classification.device_id,
        "config": config.config_values,
        "published_at": Utc::now().to_rfc3339(),
    }))
    .context("Failed to serialize config payload")?;

    let published = match publisher
        .publish(&channel, &classification.device_id, &payload)
        .await
    {
        Ok(()) => {
            info!(
                device_id = %classification.device_id,
                channel = %channel,
                "Config published to device channel"
            );
            metrics::counter!("gateway.config.pushes_published").increment(1);
            true
        }
        Err(e) => {
            error!(
                device_id = %classification.device_id,
                channel = %channel,
                error = %e,
                "Failed to publish config to device channel"
            );
            metrics::counter!("gateway.config.push_failures").increment(1);
            false
        }
    };

    Ok(ConfigUpdateStatus {
        available: true,
        published,
    })
}

/// Best-effort acknowledgment for buses that supply a `messageId`.
async fn publish_acknowledgment(state: &AppState, envelope: &TelemetryEnvelope, device_id: &str) {
    let Some(message_id) = envelope.correlation_id.as_deref() else {
        return;
    };
    let Some(publisher) = &state.publisher else {
        return;
    };

    let channel = classifier::ack_channel(device_id);
    let payload = serde_json::json!({
        "device_id": device_id,
        "message_id": message_id,
        "status": "received",
        "acknowledged_at": Utc::now().to_rfc3339(),
    });
    let Ok(bytes) = serde_json::to_vec(&payload) else {
        return;
    };

    if let Err(e) = publisher.publish(&channel, device_id, &bytes).await {
        error!(
            device_id = %device_id,
            channel = %channel,
            error = %e,
            "Failed to publish acknowledgment"
        );
    } else {
        metrics::counter!("gateway.telemetry.acks_published").increment(1);
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_history_limit() -> i64 {
    100
}

/// Telemetry history for one device, newest first.
async fn list_device_events(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Response, GatewayError> {
    let events = state
        .telemetry_store
        .list_device_events(&device_id, params.limit.min(500), params.offset)
        .await?;

    let count = events.len();
    Ok(Json(serde_json::json!({
        "success": true,
        "data": events,
        "count": count,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::MockArtifactStore;
    use crate::decoder::MockDeviceDecoder;
    use crate::ecg_store::MockEcgStore;
    use crate::publisher::{ChannelPublisher, MockChannelPublisher, PublishError};
    use crate::telemetry_store::{MockTelemetryStore, PendingDeviceConfig, StoredTelemetryEvent};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn stored_event(device_id: &str) -> StoredTelemetryEvent {
        StoredTelemetryEvent {
            id: Uuid::new_v4(),
            device_family: "BIPAP".to_string(),
            device_id: device_id.to_string(),
            device_status: 1,
            raw_payload: "VAPS_MODE,S,1,A,2".to_string(),
            decoded_fields: json!({}),
            received_at: Utc::now(),
        }
    }

    fn pending_config(device_id: &str) -> PendingDeviceConfig {
        PendingDeviceConfig {
            device_id: device_id.to_string(),
            config_values: json!({"pressure_max": 20}),
            pending_update: true,
        }
    }

    fn decoder_ok() -> MockDeviceDecoder {
        let mut decoder = MockDeviceDecoder::new();
        decoder
            .expect_decode()
            .returning(|_, _| Ok(serde_json::Map::new()));
        decoder
    }

    fn test_state(
        telemetry: MockTelemetryStore,
        decoder: MockDeviceDecoder,
        publisher: Option<MockChannelPublisher>,
    ) -> AppState {
        AppState {
            telemetry_store: Arc::new(telemetry),
            ecg_store: Arc::new(MockEcgStore::new()),
            artifact_store: Arc::new(MockArtifactStore::new()),
            decoder: Arc::new(decoder),
            publisher: publisher.map(|p| Arc::new(p) as Arc<dyn ChannelPublisher>),
            presigned_url_expiry: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_pending_config_published_to_derived_channel() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .withf(|e| e.device_id == "dev7" && e.raw_payload == "VAPS_MODE,S,1,A,2")
            .times(1)
            .return_once(|_| Ok(stored_event("dev7")));
        telemetry
            .expect_find_pending_config()
            .withf(|id: &str| id == "dev7")
            .times(1)
            .return_once(|_| Ok(Some(pending_config("dev7"))));

        let mut publisher = MockChannelPublisher::new();
        publisher
            .expect_publish()
            .withf(|channel: &str, key: &str, _payload: &[u8]| {
                channel == "devices/dev7/config/update" && key == "dev7"
            })
            .times(1)
            .return_once(|_, _, _| Ok(()));

        let state = test_state(telemetry, decoder_ok(), Some(publisher));
        let body = json!({
            "device_status": 1,
            "device_data": "VAPS_MODE,S,1,A,2",
            "topic": "devices/dev7/data"
        });

        let response = ingest(&state, body, Uuid::new_v4()).await.unwrap();

        assert!(response.success);
        assert_eq!(response.data.device_id, "dev7");
        assert_eq!(
            response.config_update,
            ConfigUpdateStatus {
                available: true,
                published: true
            }
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .times(1)
            .return_once(|_| Ok(stored_event("dev7")));
        telemetry
            .expect_find_pending_config()
            .times(1)
            .return_once(|_| Ok(Some(pending_config("dev7"))));

        let mut publisher = MockChannelPublisher::new();
        publisher.expect_publish().times(1).return_once(|_, _, _| {
            Err(PublishError::Send {
                channel: "devices/dev7/config/update".to_string(),
                message: "broker down".to_string(),
            })
        });

        let state = test_state(telemetry, decoder_ok(), Some(publisher));
        let body = json!({
            "device_status": 1,
            "device_data": "VAPS_MODE,S,1,A,2",
            "topic": "devices/dev7/data"
        });

        let response = ingest(&state, body, Uuid::new_v4()).await.unwrap();

        // The telemetry was already durably recorded; the push failure
        // must not fail the request.
        assert!(response.success);
        assert_eq!(
            response.config_update,
            ConfigUpdateStatus {
                available: true,
                published: false
            }
        );
    }

    #[tokio::test]
    async fn test_no_bus_configured_disables_push() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .times(1)
            .return_once(|_| Ok(stored_event("dev7")));
        telemetry
            .expect_find_pending_config()
            .times(1)
            .return_once(|_| Ok(Some(pending_config("dev7"))));

        let state = test_state(telemetry, decoder_ok(), None);
        let body = json!({
            "device_status": 1,
            "device_data": "VAPS_MODE,S,1,A,2",
            "topic": "devices/dev7/data"
        });

        let response = ingest(&state, body, Uuid::new_v4()).await.unwrap();

        assert_eq!(
            response.config_update,
            ConfigUpdateStatus {
                available: true,
                published: false
            }
        );
    }

    #[tokio::test]
    async fn test_no_pending_config() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .times(1)
            .return_once(|_| Ok(stored_event("24")));
        telemetry
            .expect_find_pending_config()
            .withf(|id: &str| id == "24")
            .times(1)
            .return_once(|_| Ok(None));

        // Publisher configured but never invoked.
        let publisher = MockChannelPublisher::new();

        let state = test_state(telemetry, decoder_ok(), Some(publisher));
        let body = json!({
            "device_status": 0,
            "device_data": "VAPS_MODE,S,1,A,2",
            "topic": "esp32/data24"
        });

        let response = ingest(&state, body, Uuid::new_v4()).await.unwrap();

        assert_eq!(response.data.device_id, "24");
        assert_eq!(response.config_update, ConfigUpdateStatus::default());
    }

    #[tokio::test]
    async fn test_acknowledgment_published_for_correlated_messages() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .times(1)
            .return_once(|_| Ok(stored_event("24")));
        telemetry
            .expect_find_pending_config()
            .times(1)
            .return_once(|_| Ok(None));

        let mut publisher = MockChannelPublisher::new();
        publisher
            .expect_publish()
            .withf(|channel: &str, _key: &str, payload: &[u8]| {
                let body: Value = serde_json::from_slice(payload).unwrap();
                channel == "devices/24/ack" && body["message_id"] == "msg-42"
            })
            .times(1)
            .return_once(|_, _, _| Ok(()));

        let state = test_state(telemetry, decoder_ok(), Some(publisher));
        let body = json!({
            "device_status": 1,
            "device_data": "VAPS_MODE,S,1,A,2",
            "topic": "esp32/data24",
            "messageId": "msg-42"
        });

        let response = ingest(&state, body, Uuid::new_v4()).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_decode_failure_is_terminal_and_skips_persistence() {
        let mut decoder = MockDeviceDecoder::new();
        decoder
            .expect_decode()
            .times(1)
            .return_once(|_, _| Err(GatewayError::Decode("no section markers".into())));

        // No insert_event expectation: persistence must not be reached.
        let telemetry = MockTelemetryStore::new();

        let state = test_state(telemetry, decoder, None);
        let body = json!({"device_status": 1, "device_data": "garbage"});

        let err = ingest(&state, body, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn test_store_unavailable_propagates() {
        let mut telemetry = MockTelemetryStore::new();
        telemetry
            .expect_insert_event()
            .times(1)
            .return_once(|_| Err(GatewayError::StoreUnavailable));

        let state = test_state(telemetry, decoder_ok(), None);
        let body = json!({"device_status": 1, "device_data": "VAPS_MODE,S,1,A,2"});

        let err = ingest(&state, body, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_validation_failure_touches_no_collaborator() {
        let state = test_state(MockTelemetryStore::new(), MockDeviceDecoder::new(), None);
        let body = json!({"device_status": 1});

        let err = ingest(&state, body, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.to_string(), "device_data is required");
    }
}
