use crate::envelope::TelemetryEnvelope;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of respiratory-therapy device families. The family selects
/// which protocol decoder applies to the raw data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFamily {
    #[serde(rename = "CPAP")]
    Cpap,
    #[serde(rename = "BIPAP")]
    Bipap,
}

impl DeviceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::Cpap => "CPAP",
            DeviceFamily::Bipap => "BIPAP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CPAP" => Some(DeviceFamily::Cpap),
            "BIPAP" => Some(DeviceFamily::Bipap),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic grammar spoken by a device, discriminated by the first path
/// segment. Each scheme owns its id extraction and its reply-channel
/// derivation, so a new convention is a new variant rather than an edit
/// to existing branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicScheme {
    /// `devices/{device_id}/data` — one channel per device.
    PerDevice,
    /// `esp32/data{id}` or `esp32/{id}` — legacy flat namespace.
    LegacyFlat,
}

/// A routing topic recognized as one of the known grammars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic<'a> {
    pub scheme: TopicScheme,
    raw: &'a str,
    second: &'a str,
}

impl<'a> ParsedTopic<'a> {
    /// Recognize a topic by its first path segment. Topics with fewer than
    /// two segments or an unknown leading segment are not classified.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let mut segments = topic.split('/');
        let first = segments.next()?;
        let second = segments.next()?;

        let scheme = match first {
            "devices" => TopicScheme::PerDevice,
            "esp32" => TopicScheme::LegacyFlat,
            _ => return None,
        };

        Some(Self {
            scheme,
            raw: topic,
            second,
        })
    }

    /// Extract the device id encoded in the topic.
    ///
    /// The legacy flat grammar packs the id behind a `data` prefix token
    /// (`esp32/data24` → `24`); a bare segment is the id itself, and an
    /// empty segment falls back to the namespace literal.
    pub fn device_id(&self) -> String {
        match self.scheme {
            TopicScheme::PerDevice => self.second.to_string(),
            TopicScheme::LegacyFlat => {
                let stripped = self.second.replacen("data", "", 1);
                if !stripped.is_empty() {
                    stripped
                } else if !self.second.is_empty() {
                    self.second.to_string()
                } else {
                    "esp32".to_string()
                }
            }
        }
    }

    /// Channel the device is known to subscribe to for configuration
    /// pushes. Legacy flat devices subscribe to the same topic they
    /// publish on; per-device-channel devices subscribe to a dedicated
    /// `config/update` channel.
    pub fn reply_channel(&self) -> String {
        match self.scheme {
            TopicScheme::PerDevice => format!("devices/{}/config/update", self.second),
            TopicScheme::LegacyFlat => self.raw.to_string(),
        }
    }
}

/// Derive the config-push channel for a device, preferring the grammar of
/// the topic the event arrived on and defaulting to the per-device
/// convention when the topic is absent or unrecognized.
pub fn reply_channel(routing_topic: Option<&str>, device_id: &str) -> String {
    routing_topic
        .and_then(ParsedTopic::parse)
        .map(|t| t.reply_channel())
        .unwrap_or_else(|| format!("devices/{device_id}/config/update"))
}

/// Channel acknowledgment publishes go to.
pub fn ack_channel(device_id: &str) -> String {
    format!("devices/{device_id}/ack")
}

/// Fully-resolved device identity for one telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub device_id: String,
    pub family: DeviceFamily,
}

/// Content-sniffing rules for family detection, evaluated in fixed order.
/// BIPAP-unique markers are checked first: CPAP markers can appear as
/// substrings of ambiguous data, while the BIPAP markers are distinctive.
/// Reordering silently misclassifies devices; the tests pin this order.
const FAMILY_RULES: &[(fn(&str) -> bool, DeviceFamily)] = &[
    (has_bipap_markers, DeviceFamily::Bipap),
    (has_cpap_markers, DeviceFamily::Cpap),
    (has_bipap_section_profile, DeviceFamily::Bipap),
    (is_nonempty, DeviceFamily::Cpap),
];

/// Family applied when no rule matches (empty raw data).
const DEFAULT_FAMILY: DeviceFamily = DeviceFamily::Bipap;

fn has_bipap_markers(data: &str) -> bool {
    data.contains("VAPS_MODE") || data.contains("BIPAP")
}

fn has_cpap_markers(data: &str) -> bool {
    data.contains("CPAP")
        || data.contains("MANUALMODE")
        || (data.contains("G,") && data.contains("H,") && data.contains("I,"))
}

/// CPAP streams carry S, G, H, I sections; BIPAP streams carry
/// S, A, B, C, D, E, F. More than 5 section markers reads as BIPAP.
fn has_bipap_section_profile(data: &str) -> bool {
    section_marker_count(data) > 5
}

fn is_nonempty(data: &str) -> bool {
    !data.is_empty()
}

/// Count uppercase-letter-followed-by-comma section markers.
fn section_marker_count(data: &str) -> usize {
    data.as_bytes()
        .windows(2)
        .filter(|w| w[0].is_ascii_uppercase() && w[1] == b',')
        .count()
}

/// Resolve a device id and family for the envelope. Total: classification
/// never blocks persistence, so every input resolves to some identity.
pub fn classify(envelope: &TelemetryEnvelope) -> Classification {
    Classification {
        device_id: resolve_device_id(envelope),
        family: resolve_family(envelope),
    }
}

fn resolve_device_id(envelope: &TelemetryEnvelope) -> String {
    if let Some(id) = envelope.declared_device_id.as_deref() {
        if !id.is_empty() {
            return id.to_string();
        }
    }

    if let Some(parsed) = envelope.routing_topic.as_deref().and_then(ParsedTopic::parse) {
        return parsed.device_id();
    }

    // No identity anywhere in the event; synthesize a unique, non-null id
    // so the record can still be stored.
    format!("device_{}", Utc::now().timestamp_millis())
}

fn resolve_family(envelope: &TelemetryEnvelope) -> DeviceFamily {
    if let Some(family) = envelope.declared_family.as_deref().and_then(DeviceFamily::parse) {
        return family;
    }

    for (rule, family) in FAMILY_RULES {
        if rule(&envelope.raw_device_data) {
            return *family;
        }
    }

    DEFAULT_FAMILY
}
