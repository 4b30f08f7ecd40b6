use crate::classifier::DeviceFamily;
use crate::error::GatewayError;
use serde_json::{Map, Value};

/// Device-protocol decoder seam. Implementations turn a raw device data
/// string into structured fields for the family's grammar.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceDecoder: Send + Sync {
    fn decode(&self, raw: &str, family: DeviceFamily) -> Result<Map<String, Value>, GatewayError>;
}

/// Structural decoder shared by both families.
///
/// CPAP and BIPAP streams interleave single-letter section markers with
/// their values (`S,1,20,G,4.5,...`), optionally preceded by mode tokens
/// such as `VAPS_MODE`. This decoder groups values under their section
/// marker without interpreting the per-family field layout.
pub struct SectionDecoder;

impl DeviceDecoder for SectionDecoder {
    fn decode(&self, raw: &str, _family: DeviceFamily) -> Result<Map<String, Value>, GatewayError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Decode("empty device data".into()));
        }

        let mut fields = Map::new();
        let mut preamble: Vec<Value> = Vec::new();
        let mut current: Option<(String, Vec<Value>)> = None;
        let mut saw_marker = false;

        for token in trimmed.split(',') {
            let token = token.trim();
            if is_section_marker(token) {
                saw_marker = true;
                if let Some((marker, values)) = current.take() {
                    fields.insert(marker, Value::Array(values));
                }
                current = Some((token.to_string(), Vec::new()));
            } else if let Some((_, values)) = current.as_mut() {
                values.push(parse_scalar(token));
            } else if !token.is_empty() {
                // Mode tokens ahead of the first section marker.
                preamble.push(parse_scalar(token));
            }
        }

        if let Some((marker, values)) = current.take() {
            fields.insert(marker, Value::Array(values));
        }

        if !saw_marker {
            return Err(GatewayError::Decode(
                "no section markers in device data".into(),
            ));
        }

        if !preamble.is_empty() {
            fields.insert("mode".to_string(), Value::Array(preamble));
        }

        Ok(fields)
    }
}

fn is_section_marker(token: &str) -> bool {
    token.len() == 1 && token.as_bytes()[0].is_ascii_uppercase()
}

fn parse_scalar(token: &str) -> Value {
    if let Ok(n) = token.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = token.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_grouped_by_marker() {
        let fields = SectionDecoder
            .decode("S,1,20,G,4.5,off", DeviceFamily::Cpap)
            .unwrap();

        assert_eq!(fields["S"], serde_json::json!([1, 20]));
        assert_eq!(fields["G"], serde_json::json!([4.5, "off"]));
    }

    #[test]
    fn test_empty_data_is_decode_error() {
        let err = SectionDecoder.decode("  ", DeviceFamily::Bipap).unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn test_markerless_data_is_decode_error() {
        let err = SectionDecoder
            .decode("1,2,3", DeviceFamily::Bipap)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn test_mode_tokens_before_first_marker() {
        let fields = SectionDecoder
            .decode("VAPS_MODE,S,1,A,2", DeviceFamily::Bipap)
            .unwrap();
        assert_eq!(fields["mode"], serde_json::json!(["VAPS_MODE"]));
        assert_eq!(fields["S"], serde_json::json!([1]));
        assert_eq!(fields["A"], serde_json::json!([2]));
    }

    #[test]
    fn test_trailing_marker_kept_with_empty_values() {
        let fields = SectionDecoder.decode("S,1,I", DeviceFamily::Cpap).unwrap();
        assert_eq!(fields["I"], serde_json::json!([]));
    }
}
