use serde_json::Map;
use serde_json::Value;
use std::fmt;
use time::format_description::well_known::Iso8601;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use time::PrimitiveDateTime;

/// Identifies a field node: `(orgId, siteId, nodeId)`.
///
/// Keys downlink reverse routing: a command for a node is handed to the
/// source that last delivered an uplink from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub org_id: String,
    pub site_id: String,
    pub node_id: String,
}

impl NodeKey {
    pub fn new(org_id: impl Into<String>, site_id: impl Into<String>, node_id: impl Into<String>) -> NodeKey {
        NodeKey {
            org_id: org_id.into(),
            site_id: site_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.site_id, self.node_id)
    }
}

/// A telemetry payload that passed validation.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub node: NodeKey,
    /// The full payload object, unmodified; fields beyond the required ones
    /// are preserved verbatim.
    pub payload: Map<String, Value>,
}

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry payload must be a JSON object")]
    NotAnObject,

    #[error("Field {field:?} must be a non-empty string")]
    InvalidField { field: &'static str },

    #[error("Telemetry payload must include an ISO-8601 'timestamp'")]
    MissingTimestamp,

    #[error("Telemetry 'timestamp' is not a valid ISO-8601 datetime: {value:?}")]
    InvalidTimestamp { value: String },

    #[error("Telemetry payload must include a non-empty 'metrics' object")]
    InvalidMetrics,

    #[error("Metric keys must be non-empty strings")]
    EmptyMetricKey,

    #[error("Metric {name:?} must be numeric")]
    NonNumericMetric { name: String },
}

const REQUIRED_STRING_FIELDS: [&str; 3] = ["orgId", "siteId", "nodeId"];

/// Check an inbound payload against the telemetry schema.
///
/// All-or-nothing: either the whole payload is valid and comes back as
/// [`Telemetry`], or the first violation is reported. No enrichment happens
/// here.
pub fn validate(payload: &Value) -> Result<Telemetry, TelemetryError> {
    let object = payload.as_object().ok_or(TelemetryError::NotAnObject)?;

    for field in REQUIRED_STRING_FIELDS {
        match object.get(field).and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => (),
            _ => return Err(TelemetryError::InvalidField { field }),
        }
    }

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or(TelemetryError::MissingTimestamp)?;
    if !is_iso8601(timestamp) {
        return Err(TelemetryError::InvalidTimestamp {
            value: timestamp.to_string(),
        });
    }

    let metrics = object
        .get("metrics")
        .and_then(Value::as_object)
        .filter(|metrics| !metrics.is_empty())
        .ok_or(TelemetryError::InvalidMetrics)?;
    for (name, value) in metrics {
        if name.is_empty() {
            return Err(TelemetryError::EmptyMetricKey);
        }
        if !value.is_number() {
            return Err(TelemetryError::NonNumericMetric { name: name.clone() });
        }
    }

    let field = |name: &str| -> String {
        object
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(Telemetry {
        node: NodeKey {
            org_id: field("orgId"),
            site_id: field("siteId"),
            node_id: field("nodeId"),
        },
        payload: object.clone(),
    })
}

/// Accepts RFC 3339 (`Z` or numeric offset) and naive ISO-8601 date-times.
fn is_iso8601(value: &str) -> bool {
    OffsetDateTime::parse(value, &Rfc3339).is_ok()
        || OffsetDateTime::parse(value, &Iso8601::DEFAULT).is_ok()
        || PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).is_ok()
}
