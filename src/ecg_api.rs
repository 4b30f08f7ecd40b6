use crate::artifact_store::{artifact_key, ArtifactKind, ArtifactTags};
use crate::classifier::DeviceFamily;
use crate::ecg_store::{DataSource, EcgQuery, EcgStatus, NewEcgRecord};
use crate::error::{error_response, GatewayError};
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ecg/records", post(receive_ecg).get(list_ecg_records))
        .route("/ecg/records/:record_id", get(get_ecg_record))
        .route(
            "/ecg/records/:record_id/presigned-urls",
            post(issue_presigned_urls),
        )
}

const PDF_DATA_URL_PREFIX: &str = "data:application/pdf;base64,";

/// Inbound ECG submission. The JSON payload arrives as an object or a
/// JSON-encoded string; the PDF as base64 (optionally data-URL prefixed)
/// or a raw byte array.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EcgIngestRequest {
    pub device_id: Option<String>,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub ecg_json_data: Option<Value>,
    pub ecg_pdf_data: Option<String>,
    pub ecg_pdf_buffer: Option<Vec<u8>>,
    pub recording_date: Option<String>,
    pub recording_duration: Option<f64>,
    pub sample_rate: Option<f64>,
    pub leads: Option<Vec<String>>,
    pub data_source: Option<String>,
    pub linked_device_id: Option<String>,
    pub linked_device_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EcgIngestResponse {
    pub success: bool,
    pub message: String,
    pub data: EcgIngestData,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct EcgIngestData {
    pub ecg_record_id: Uuid,
    pub device_id: String,
    pub patient_id: Option<String>,
    pub session_id: Option<String>,
    pub json_url: String,
    pub pdf_url: String,
    pub recording_date: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Receive and store one ECG reading: a JSON waveform payload and its
/// rendered PDF report, bound together by a single record.
async fn receive_ecg(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request_id = Uuid::new_v4();
    info!(request_id = %request_id, "Received ECG data request");

    let request: EcgIngestRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Malformed ECG request body");
            return error_response(
                &GatewayError::Validation(format!("Invalid request body: {e}")),
                Some(request_id),
            );
        }
    };

    match ingest_ecg(&state, request, request_id).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            match &e {
                GatewayError::Validation(_) => {
                    warn!(request_id = %request_id, error = %e, "ECG request rejected")
                }
                _ => error!(request_id = %request_id, error = %e, "ECG ingestion failed"),
            }
            error_response(&e, Some(request_id))
        }
    }
}

/// Ingestion sequence: validate, parse, upload both artifacts
/// concurrently, then compose and persist the binding record. A record is
/// only written once both artifacts are stored; a failed sibling upload is
/// not rolled back.
#[instrument(skip_all, fields(request_id = %request_id))]
async fn ingest_ecg(
    state: &AppState,
    request: EcgIngestRequest,
    request_id: Uuid,
) -> Result<EcgIngestResponse, GatewayError> {
    let device_id = match request.device_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(GatewayError::required("device_id")),
    };

    let payload = parse_structured_payload(request.ecg_json_data.as_ref())?;
    let pdf_bytes = extract_pdf_bytes(&request)?;

    let explicit_recording_date = request
        .recording_date
        .as_deref()
        .map(parse_rfc3339)
        .transpose()?;

    let data_source = match request.data_source.as_deref() {
        None => DataSource::Software,
        Some(s) => DataSource::parse(s).ok_or_else(|| {
            GatewayError::Validation(
                "data_source must be one of: software, api, webhook, direct".into(),
            )
        })?,
    };

    let linked_device_family = request
        .linked_device_type
        .as_deref()
        .map(|s| {
            DeviceFamily::parse(s).ok_or_else(|| {
                GatewayError::Validation("linked_device_type must be CPAP or BIPAP".into())
            })
        })
        .transpose()?
        .map(|f| f.as_str().to_string());

    // Artifacts are keyed off the effective recording timestamp so
    // repeated uploads for the same device and time stay traceable.
    let effective_ts = explicit_recording_date.unwrap_or_else(Utc::now);
    let json_key = artifact_key(&device_id, ArtifactKind::Json, effective_ts);
    let pdf_key = artifact_key(&device_id, ArtifactKind::Pdf, effective_ts);

    let patient_id = request
        .patient_id
        .clone()
        .or_else(|| opt_string(&payload, "patient_id"));
    let session_id = request
        .session_id
        .clone()
        .or_else(|| opt_string(&payload, "session_id"));

    let tags = ArtifactTags {
        device_id: device_id.clone(),
        patient_id: patient_id.clone().unwrap_or_default(),
        session_id: session_id.clone().unwrap_or_default(),
        recording_date: effective_ts.to_rfc3339(),
    };

    let json_bytes = serde_json::to_vec(&payload)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e).context("Failed to serialize ECG payload")))?;

    info!(
        request_id = %request_id,
        device_id = %device_id,
        json_size = json_bytes.len(),
        pdf_size = pdf_bytes.len(),
        "Uploading ECG artifacts"
    );

    // Fan-out/fan-in: both uploads run concurrently and both must succeed
    // before the record exists. The first failure surfaces as-is; an
    // already-stored sibling becomes an orphan object.
    let (json_artifact, pdf_artifact) = tokio::try_join!(
        state.artifact_store.put(
            &json_key,
            json_bytes,
            ArtifactKind::Json.content_type(),
            &tags
        ),
        state.artifact_store.put(
            &pdf_key,
            pdf_bytes,
            ArtifactKind::Pdf.content_type(),
            &tags
        ),
    )?;

    // Explicit request fields win over values embedded in the payload.
    let recording_date = explicit_recording_date
        .or_else(|| opt_date(&payload, "recording_date"))
        .or_else(|| opt_date(&payload, "timestamp"))
        .unwrap_or(effective_ts);
    let recording_duration_secs = request
        .recording_duration
        .or_else(|| opt_f64(&payload, "duration"))
        .or_else(|| opt_f64(&payload, "recording_duration"));
    let sample_rate_hz = request
        .sample_rate
        .or_else(|| opt_f64(&payload, "sample_rate"))
        .or_else(|| opt_f64(&payload, "sampling_rate"));
    let leads = request
        .leads
        .clone()
        .filter(|l| !l.is_empty())
        .or_else(|| opt_string_array(&payload, "leads"))
        .or_else(|| opt_string_array(&payload, "channels"))
        .unwrap_or_default();

    let record = state
        .ecg_store
        .insert(NewEcgRecord {
            device_id: device_id.clone(),
            patient_id,
            session_id,
            structured_payload: Value::Object(payload),
            json_storage_key: json_artifact.storage_key,
            json_url: json_artifact.retrieval_url,
            json_size_bytes: json_artifact.size_bytes,
            pdf_storage_key: pdf_artifact.storage_key,
            pdf_url: pdf_artifact.retrieval_url,
            pdf_size_bytes: pdf_artifact.size_bytes,
            bucket: json_artifact.bucket,
            recording_date,
            recording_duration_secs,
            sample_rate_hz,
            leads,
            status: EcgStatus::Uploaded,
            data_source,
            linked_device_id: request.linked_device_id.clone(),
            linked_device_family,
        })
        .await?;

    info!(
        request_id = %request_id,
        record_id = %record.id,
        "ECG record saved"
    );

    Ok(EcgIngestResponse {
        success: true,
        message: "ECG data received and saved successfully".to_string(),
        data: EcgIngestData {
            ecg_record_id: record.id,
            device_id: record.device_id,
            patient_id: record.patient_id,
            session_id: record.session_id,
            json_url: record.json_url,
            pdf_url: record.pdf_url,
            recording_date: record.recording_date,
            received_at: record.received_at,
        },
        request_id,
    })
}

/// Parse the JSON payload field: an object is taken as-is, a string must
/// itself parse as a JSON object.
fn parse_structured_payload(value: Option<&Value>) -> Result<Map<String, Value>, GatewayError> {
    let value = match value {
        None | Some(Value::Null) => return Err(GatewayError::required("ecg_json_data")),
        Some(v) => v,
    };

    let parsed = match value {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| GatewayError::Validation(format!("Invalid JSON data: {e}")))?,
        other => other.clone(),
    };

    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(GatewayError::Validation(
            "ecg_json_data must be a JSON object".into(),
        )),
    }
}

/// Materialize the PDF bytes: a raw byte array wins, otherwise the base64
/// field is decoded after stripping the optional data-URL scheme marker.
fn extract_pdf_bytes(request: &EcgIngestRequest) -> Result<Vec<u8>, GatewayError> {
    if let Some(buffer) = &request.ecg_pdf_buffer {
        if buffer.is_empty() {
            return Err(GatewayError::Validation("Invalid PDF data".into()));
        }
        return Ok(buffer.clone());
    }

    let Some(encoded) = request.ecg_pdf_data.as_deref() else {
        return Err(GatewayError::Validation(
            "ecg_pdf_data (base64) or ecg_pdf_buffer is required".into(),
        ));
    };

    let encoded = encoded.strip_prefix(PDF_DATA_URL_PREFIX).unwrap_or(encoded);
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::Validation("Invalid PDF data".into()))?;

    if bytes.is_empty() {
        return Err(GatewayError::Validation("Invalid PDF data".into()));
    }

    Ok(bytes)
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| {
            GatewayError::Validation("recording_date must be an RFC 3339 timestamp".into())
        })
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn opt_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key)?.as_f64()
}

fn opt_date(map: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let s = map.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

fn opt_string_array(map: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let values = map.get(key)?.as_array()?;
    let strings: Vec<String> = values
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    if strings.is_empty() {
        None
    } else {
        Some(strings)
    }
}

/// Query parameters for the ECG list endpoint.
#[derive(Debug, Deserialize)]
struct EcgListParams {
    device_id: Option<String>,
    patient_id: Option<String>,
    session_id: Option<String>,
    status: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    #[serde(default = "default_list_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_list_limit() -> i64 {
    100
}

/// List ECG records with filtering and pagination. Large payload fields
/// are excluded from list rows by projection.
async fn list_ecg_records(
    State(state): State<AppState>,
    Query(params): Query<EcgListParams>,
) -> Result<Response, GatewayError> {
    if let Some(status) = params.status.as_deref() {
        if EcgStatus::parse(status).is_none() {
            return Err(GatewayError::Validation(
                "status must be one of: uploaded, processed, analyzed, error".into(),
            ));
        }
    }

    let query = EcgQuery {
        device_id: params.device_id,
        patient_id: params.patient_id,
        session_id: params.session_id,
        status: params.status,
        start_date: params.start_date,
        end_date: params.end_date,
        limit: params.limit.clamp(1, 500),
        offset: params.offset.max(0),
    };

    let records = state.ecg_store.query(&query).await?;
    let total = state.ecg_store.count(&query).await?;
    let has_more = query.offset + (records.len() as i64) < total;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": records,
        "pagination": {
            "total": total,
            "limit": query.limit,
            "offset": query.offset,
            "has_more": has_more,
        },
    }))
    .into_response())
}

/// Fetch a single ECG record, including the structured payload.
async fn get_ecg_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let record = state
        .ecg_store
        .get(record_id)
        .await?
        .ok_or(GatewayError::NotFound("ECG record"))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": record,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PresignRequest {
    expires_in_seconds: Option<u64>,
}

/// Issue time-limited read URLs for both artifacts of a record.
async fn issue_presigned_urls(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    body: Option<Json<PresignRequest>>,
) -> Result<Response, GatewayError> {
    let expires_in = body
        .and_then(|Json(b)| b.expires_in_seconds)
        .map(Duration::from_secs)
        .unwrap_or(state.presigned_url_expiry);

    let record = state
        .ecg_store
        .get(record_id)
        .await?
        .ok_or(GatewayError::NotFound("ECG record"))?;

    let (json_url, pdf_url) = tokio::try_join!(
        state.artifact_store.presign(&record.json_storage_key, expires_in),
        state.artifact_store.presign(&record.pdf_storage_key, expires_in),
    )?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "json_url": json_url,
            "pdf_url": pdf_url,
            "expires_in": expires_in.as_secs(),
        },
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::{MockArtifactStore, StoredArtifact};
    use crate::decoder::MockDeviceDecoder;
    use crate::ecg_store::{EcgRecord, MockEcgStore};
    use crate::telemetry_store::MockTelemetryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn stored_artifact(key: &str, content_type: &str, size: i64) -> StoredArtifact {
        StoredArtifact {
            storage_key: key.to_string(),
            retrieval_url: format!("https://artifacts.test/{key}"),
            bucket: "ecg-artifacts".to_string(),
            size_bytes: size,
            content_type: content_type.to_string(),
        }
    }

    fn echo_record(record: NewEcgRecord) -> EcgRecord {
        EcgRecord {
            id: Uuid::new_v4(),
            device_id: record.device_id,
            patient_id: record.patient_id,
            session_id: record.session_id,
            structured_payload: record.structured_payload,
            json_storage_key: record.json_storage_key,
            json_url: record.json_url,
            json_size_bytes: record.json_size_bytes,
            pdf_storage_key: record.pdf_storage_key,
            pdf_url: record.pdf_url,
            pdf_size_bytes: record.pdf_size_bytes,
            bucket: record.bucket,
            recording_date: record.recording_date,
            recording_duration_secs: record.recording_duration_secs,
            sample_rate_hz: record.sample_rate_hz,
            leads: record.leads,
            status: record.status.as_str().to_string(),
            data_source: record.data_source.as_str().to_string(),
            linked_device_id: record.linked_device_id,
            linked_device_family: record.linked_device_family,
            received_at: Utc::now(),
        }
    }

    fn artifact_store_ok() -> MockArtifactStore {
        let mut store = MockArtifactStore::new();
        store
            .expect_put()
            .returning(|key, bytes, content_type, _tags| {
                Ok(stored_artifact(key, content_type, bytes.len() as i64))
            });
        store
    }

    fn test_state(artifacts: MockArtifactStore, ecg: MockEcgStore) -> AppState {
        AppState {
            telemetry_store: Arc::new(MockTelemetryStore::new()),
            ecg_store: Arc::new(ecg),
            artifact_store: Arc::new(artifacts),
            decoder: Arc::new(MockDeviceDecoder::new()),
            publisher: None,
            presigned_url_expiry: Duration::from_secs(3600),
        }
    }

    fn request(body: Value) -> EcgIngestRequest {
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_extracts_payload_metadata() {
        let mut ecg = MockEcgStore::new();
        ecg.expect_insert()
            .withf(|r| {
                r.device_id == "dev1"
                    && r.sample_rate_hz == Some(250.0)
                    && r.leads == vec!["I".to_string(), "II".to_string()]
                    && r.status == EcgStatus::Uploaded
                    && r.data_source == DataSource::Software
            })
            .times(1)
            .returning(|r| Ok(echo_record(r)));

        let state = test_state(artifact_store_ok(), ecg);
        let req = request(json!({
            "device_id": "dev1",
            "ecg_json_data": {"sample_rate": 250, "leads": ["I", "II"]},
            "ecg_pdf_data": STANDARD.encode(b"abc"),
        }));

        let response = ingest_ecg(&state, req, Uuid::new_v4()).await.unwrap();

        assert!(response.success);
        assert_eq!(response.data.device_id, "dev1");
        assert!(response.data.json_url.contains("_json.json"));
        assert!(response.data.pdf_url.contains("_pdf.pdf"));
    }

    #[tokio::test]
    async fn test_explicit_leads_win_over_payload_channels() {
        let mut ecg = MockEcgStore::new();
        ecg.expect_insert()
            .withf(|r| r.leads == vec!["I".to_string(), "II".to_string()])
            .times(1)
            .returning(|r| Ok(echo_record(r)));

        let state = test_state(artifact_store_ok(), ecg);
        let req = request(json!({
            "device_id": "dev1",
            "leads": ["I", "II"],
            "ecg_json_data": {"channels": ["V1", "V2", "V3"]},
            "ecg_pdf_data": STANDARD.encode(b"%PDF-1.4"),
        }));

        ingest_ecg(&state, req, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_payload_channels_used_when_no_leads_given() {
        let mut ecg = MockEcgStore::new();
        ecg.expect_insert()
            .withf(|r| r.leads == vec!["V1".to_string()])
            .times(1)
            .returning(|r| Ok(echo_record(r)));

        let state = test_state(artifact_store_ok(), ecg);
        let req = request(json!({
            "device_id": "dev1",
            "ecg_json_data": {"channels": ["V1"]},
            "ecg_pdf_data": STANDARD.encode(b"%PDF-1.4"),
        }));

        ingest_ecg(&state, req, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_duration_synonym_extracted() {
        let mut ecg = MockEcgStore::new();
        ecg.expect_insert()
            .withf(|r| r.recording_duration_secs == Some(30.0))
            .times(1)
            .returning(|r| Ok(echo_record(r)));

        let state = test_state(artifact_store_ok(), ecg);
        let req = request(json!({
            "device_id": "dev1",
            "ecg_json_data": {"duration": 30},
            "ecg_pdf_data": STANDARD.encode(b"%PDF-1.4"),
        }));

        ingest_ecg(&state, req, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_failure_creates_no_record() {
        let mut artifacts = MockArtifactStore::new();
        artifacts
            .expect_put()
            .withf(|_key, _bytes, content_type: &str, _tags| content_type == "application/json")
            .returning(|key, bytes, content_type, _tags| {
                Ok(stored_artifact(key, content_type, bytes.len() as i64))
            });
        artifacts
            .expect_put()
            .withf(|_key, _bytes, content_type: &str, _tags| content_type == "application/pdf")
            .returning(|_, _, _, _| Err(GatewayError::ArtifactUpload("bucket unreachable".into())));

        // No insert expectation: the record must never be written.
        let ecg = MockEcgStore::new();

        let state = test_state(artifacts, ecg);
        let req = request(json!({
            "device_id": "dev1",
            "ecg_json_data": {"sample_rate": 250},
            "ecg_pdf_data": STANDARD.encode(b"%PDF-1.4"),
        }));

        let err = ingest_ecg(&state, req, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ArtifactUpload(_)));
    }

    #[tokio::test]
    async fn test_validation_order() {
        let state = test_state(MockArtifactStore::new(), MockEcgStore::new());

        let err = ingest_ecg(&state, request(json!({})), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "device_id is required");

        let err = ingest_ecg(
            &state,
            request(json!({"device_id": "dev1"})),
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "ecg_json_data is required");

        let err = ingest_ecg(
            &state,
            request(json!({"device_id": "dev1", "ecg_json_data": "{not json"})),
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON data"));

        let err = ingest_ecg(
            &state,
            request(json!({"device_id": "dev1", "ecg_json_data": {}})),
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "ecg_pdf_data (base64) or ecg_pdf_buffer is required"
        );

        let err = ingest_ecg(
            &state,
            request(json!({"device_id": "dev1", "ecg_json_data": {}, "ecg_pdf_data": ""})),
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid PDF data");
    }

    #[test]
    fn test_json_string_payload_parsed() {
        let payload =
            parse_structured_payload(Some(&json!("{\"sample_rate\": 500}"))).unwrap();
        assert_eq!(payload["sample_rate"], json!(500));
    }

    #[test]
    fn test_data_url_prefix_stripped() {
        let encoded = format!("{}{}", PDF_DATA_URL_PREFIX, STANDARD.encode(b"%PDF-1.4"));
        let req = request(json!({"ecg_pdf_data": encoded}));
        assert_eq!(extract_pdf_bytes(&req).unwrap(), b"%PDF-1.4");
    }

    #[test]
    fn test_pdf_buffer_wins_over_base64() {
        let req = request(json!({
            "ecg_pdf_buffer": [1, 2, 3],
            "ecg_pdf_data": STANDARD.encode(b"ignored"),
        }));
        assert_eq!(extract_pdf_bytes(&req).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_presigned_urls_for_missing_record_is_not_found() {
        let mut ecg = MockEcgStore::new();
        ecg.expect_get().times(1).return_once(|_| Ok(None));

        let state = test_state(MockArtifactStore::new(), ecg);

        let result = issue_presigned_urls(
            State(state),
            Path(Uuid::new_v4()),
            Some(Json(PresignRequest {
                expires_in_seconds: Some(600),
            })),
        )
        .await;

        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }
}
