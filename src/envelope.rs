use crate::error::GatewayError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;

/// Flat, transport-independent view of one inbound device event.
///
/// Produced fresh per request by [`normalize`], consumed by the classifier
/// and the ingestion orchestrator. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEnvelope {
    pub device_status: i64,
    pub raw_device_data: String,
    /// `device_type` as declared by the sender, unvalidated.
    pub declared_family: Option<String>,
    pub declared_device_id: Option<String>,
    /// Message-bus topic the event arrived on, when the rule forwards it.
    pub routing_topic: Option<String>,
    /// `messageId` supplied by the bus when it expects an acknowledgment.
    pub correlation_id: Option<String>,
}

/// Unwrap an arbitrary-shape webhook body into a [`TelemetryEnvelope`].
///
/// Rule actions deliver the device event in one of three shapes: a flat
/// JSON object, an object with the event nested under `payload`, or a
/// `payload` string holding base64-wrapped JSON. Base64 is tried before
/// plain JSON because the primary transport wraps JSON in base64.
pub fn normalize(body: Value) -> Result<TelemetryEnvelope, GatewayError> {
    let flat = unwrap_payload(body)?;

    let device_status = match flat.get("device_status") {
        None | Some(Value::Null) => return Err(GatewayError::required("device_status")),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| GatewayError::Validation("device_status must be an integer".into()))?,
    };

    let raw_device_data = match flat.get("device_data").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Err(GatewayError::required("device_data")),
    };

    Ok(TelemetryEnvelope {
        device_status,
        raw_device_data,
        declared_family: string_field(&flat, "device_type"),
        declared_device_id: string_field(&flat, "device_id"),
        routing_topic: string_field(&flat, "topic"),
        correlation_id: string_field(&flat, "messageId"),
    })
}

/// If the body nests the event under `payload`, unwrap exactly one level.
fn unwrap_payload(body: Value) -> Result<Value, GatewayError> {
    let Some(inner) = body.get("payload") else {
        return Ok(body);
    };

    match inner {
        Value::String(s) => decode_payload_string(s),
        _ => Ok(inner.clone()),
    }
}

fn decode_payload_string(s: &str) -> Result<Value, GatewayError> {
    if let Ok(bytes) = STANDARD.decode(s) {
        if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
            return Ok(value);
        }
    }
    serde_json::from_str::<Value>(s)
        .map_err(|e| GatewayError::Validation(format!("payload is not valid JSON: {e}")))
}

/// Read an optional field as a string, accepting numeric values since
/// devices report numeric ids.
fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
