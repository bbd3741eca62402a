//! Normalization of raw status nodes read from the feed.
//!
//! Sensor firmware writes loosely typed JSON: coordinates may be numbers or
//! strings, the state is free text in either Indonesian or English. Every
//! field is coerced to a typed value here and nothing in this module fails.

use std::fmt;

use serde_json::Value;

/// Canonical device state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Safe,
    Danger,
    Offline,
    /// Unrecognized state text, uppercased.
    Unknown(String),
}

impl DeviceState {
    /// Canonicalize free-form state text.
    pub fn from_text(text: Option<&str>) -> Self {
        let text = match text.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return DeviceState::Offline,
        };

        let lower = text.to_lowercase();
        if lower == "aman" {
            return DeviceState::Safe;
        }
        if lower.contains("jatuh") || lower.contains("danger") {
            return DeviceState::Danger;
        }

        match text.to_uppercase().as_str() {
            "SAFE" => DeviceState::Safe,
            "OFFLINE" => DeviceState::Offline,
            other => DeviceState::Unknown(other.to_string()),
        }
    }

    pub fn is_danger(&self) -> bool {
        matches!(self, DeviceState::Danger)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Safe => write!(f, "SAFE"),
            DeviceState::Danger => write!(f, "DANGER"),
            DeviceState::Offline => write!(f, "OFFLINE"),
            DeviceState::Unknown(label) => write!(f, "{}", label),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatusRecord {
    pub state: DeviceState,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: Option<i64>,
}

/// What a single feed delivery says about a device.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Record(DeviceStatusRecord),
    /// The status node does not exist: the device has never reported, or
    /// its status was cleared.
    NoData,
}

impl StatusUpdate {
    pub fn is_danger(&self) -> bool {
        match self {
            StatusUpdate::Record(record) => record.state.is_danger(),
            StatusUpdate::NoData => false,
        }
    }

    pub fn record(&self) -> Option<&DeviceStatusRecord> {
        match self {
            StatusUpdate::Record(record) => Some(record),
            StatusUpdate::NoData => None,
        }
    }
}

/// Turn a raw status node into a typed update.
///
/// `None` and JSON `null` mean the node is missing. A bare scalar is read as
/// the state text with no position.
pub fn normalize_status(node: Option<&Value>) -> StatusUpdate {
    let node = match node {
        None | Some(Value::Null) => return StatusUpdate::NoData,
        Some(node) => node,
    };

    let record = match node {
        Value::Object(fields) => DeviceStatusRecord {
            state: DeviceState::from_text(fields.get("status").and_then(text).as_deref()),
            latitude: coerce_f64(fields.get("latitude")),
            longitude: coerce_f64(fields.get("longitude")),
            timestamp: coerce_i64(fields.get("timestamp")),
        },
        scalar => DeviceStatusRecord {
            state: DeviceState::from_text(text(scalar).as_deref()),
            latitude: 0.0,
            longitude: 0.0,
            timestamp: None,
        },
    };

    StatusUpdate::Record(record)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Array(_) | Value::Object(_) => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn coerce_f64(value: Option<&Value>) -> f64 {
    value
        .and_then(text)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    let s = value.and_then(text)?;
    let s = s.trim();
    s.parse::<i64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v as i64)
    })
}
