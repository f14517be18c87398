//! Output datapoints consumed by an external exporter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record per admitted sample.
pub const METRIC_ACTIVE_SESSIONS: &str = "db.ash.active_sessions";
/// Admitted samples with a wait event.
pub const METRIC_WAIT_EVENTS: &str = "db.ash.wait_events";
/// Admitted samples blocked by another session.
pub const METRIC_BLOCKED_SESSIONS: &str = "db.ash.blocked_sessions";
/// Admitted samples whose query exceeds the slow threshold; value is duration in ms.
pub const METRIC_LONG_RUNNING_QUERIES: &str = "db.ash.long_running_queries";

/// Attribute value of a datapoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// A single metric datapoint with ordered attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl DataPoint {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Sets an attribute only when a value is present.
    pub fn with_opt<V: Into<AttrValue>>(mut self, key: &str, value: Option<V>) -> Self {
        if let Some(v) = value {
            self.attributes.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(AttrValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}
