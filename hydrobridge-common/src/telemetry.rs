use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed register value.
///
/// Every register decodes to one of these two shapes; consumers match on the
/// variant instead of guessing at a dynamic type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// Numeric reading (scaled or native-width integer/float).
    Numeric(f64),

    /// Boolean reading (on/off registers).
    Boolean(bool),
}

impl Value {
    /// Numeric view of the value. Booleans map to `1.0` / `0.0`.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Numeric(v) => *v,
            Value::Boolean(true) => 1.0,
            Value::Boolean(false) => 0.0,
        }
    }

    /// Return the number if this is a numeric value.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            Value::Boolean(_) => None,
        }
    }

    /// Whether the value counts as "on": `true`, or any nonzero number.
    pub fn is_on(&self) -> bool {
        match self {
            Value::Numeric(v) => *v != 0.0,
            Value::Boolean(b) => *b,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Numeric(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Numeric(v as f64)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Numeric(v as f64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Numeric(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Numeric(v) => write!(f, "{}", v),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// One sample in a register's history.
///
/// `value` is only empty for a register that has never been read
/// successfully; failed reads carry the previous value and set `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,

    /// The decoded (or carried-forward) value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Why the read failed or was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    /// A successful sample taken now.
    pub fn ok(value: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            value: Some(value),
            error: None,
        }
    }

    /// A failed sample taken now, carrying `previous` forward.
    pub fn carried(previous: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            value: previous,
            error: Some(error.into()),
        }
    }

    /// Set the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this sample was read without error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(3.5), Value::Numeric(3.5));
        assert_eq!(Value::from(-12i16), Value::Numeric(-12.0));
        assert_eq!(Value::from(65535u16), Value::Numeric(65535.0));
        assert_eq!(Value::from(true), Value::Boolean(true));
    }

    #[test]
    fn test_value_is_on() {
        assert!(Value::Boolean(true).is_on());
        assert!(!Value::Boolean(false).is_on());
        assert!(Value::Numeric(0.5).is_on());
        assert!(!Value::Numeric(0.0).is_on());
    }

    #[test]
    fn test_value_untagged_json() {
        assert_eq!(serde_json::to_string(&Value::Numeric(25.0)).unwrap(), "25.0");
        assert_eq!(serde_json::to_string(&Value::Boolean(false)).unwrap(), "false");

        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Numeric(42.0));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Boolean(true));
    }

    #[test]
    fn test_entry_omits_empty_fields() {
        let entry = HistoryEntry::ok(Value::Numeric(1.0));
        let json = serde_json::to_string(&entry).unwrap();

        assert!(json.contains("\"value\":1.0"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_entry_preserves_subsecond_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2025-01-02T03:04:05.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = HistoryEntry::carried(None, "no data").at(ts);

        let json = serde_json::to_string(&entry).unwrap();
        let decoded: HistoryEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.timestamp, ts);
        assert_eq!(decoded.value, None);
        assert_eq!(decoded.error.as_deref(), Some("no data"));
    }
}
