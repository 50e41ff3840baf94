/// file: src/types.rs
/// description: data model for live events, filters, stats snapshots and connection state
use crate::error::LiveEventsError;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A single event delivered by the live stream.
///
/// Only `event` is required. Every other top-level key is kept as sent in
/// `fields`; the typed accessors read the usual ones and return `None` when
/// a value is missing or of an unexpected type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub event: String,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

// A non-object `properties` is treated as no properties at all
fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

impl LiveEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            properties: Map::new(),
            fields: Map::new(),
        }
    }

    /// Set a top-level field other than `event` or `properties`.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parse one serialized payload from the stream.
    pub fn parse(raw: &str) -> Result<Self, LiveEventsError> {
        serde_json::from_str(raw).map_err(|e| LiveEventsError::malformed(e.to_string(), raw))
    }

    /// Look up a top-level field by its wire name. An explicit `null` is
    /// returned as `Some(Value::Null)`.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "event" => Some(Value::String(self.event.clone())),
            "properties" => Some(Value::Object(self.properties.clone())),
            other => self.fields.get(other).cloned(),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.str_field("uuid")
    }

    pub fn distinct_id(&self) -> Option<&str> {
        self.str_field("distinct_id")
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.str_field("timestamp")
    }

    pub fn created_at(&self) -> Option<&str> {
        self.str_field("created_at")
    }

    /// Team id sent either as a number or as a numeric string.
    pub fn team_id(&self) -> Option<u64> {
        match self.fields.get("team_id")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A field rendered for display: strings as-is, other scalars as JSON.
    pub fn field_text(&self, key: &str) -> Option<String> {
        match self.field(key)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    /// Parsed event timestamp, if present and RFC 3339.
    pub fn datetime_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn datetime_local(&self) -> Option<DateTime<Local>> {
        self.datetime_utc().map(|dt| dt.with_timezone(&Local))
    }
}

/// Server-side stream filters. Changing them restarts the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilters {
    pub event_type: Option<String>,
}

/// A partial update merged into [`StreamFilters`].
///
/// `None` leaves a field untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterUpdate {
    pub event_type: Option<Option<String>>,
}

impl FilterUpdate {
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(Some(event_type.into())),
        }
    }

    pub fn clear_event_type() -> Self {
        Self {
            event_type: Some(None),
        }
    }
}

impl StreamFilters {
    pub fn merge(&mut self, update: FilterUpdate) {
        if let Some(event_type) = update.event_type {
            self.event_type = event_type.filter(|t| !t.is_empty());
        }
    }
}

/// Filters applied locally to the buffered events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSideFilters(BTreeMap<String, Value>);

impl ClientSideFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when every key exists on the event with an identical value.
    /// Numbers compare by value, so `2` matches `2.0`; nothing else is
    /// coerced.
    pub fn matches(&self, event: &LiveEvent) -> bool {
        self.0.iter().all(|(key, expected)| {
            event
                .field(key)
                .is_some_and(|actual| strictly_equal(&actual, expected))
        })
    }

    /// Parse a `key=value` expression. The value is read as JSON when it
    /// parses as JSON, otherwise taken as a plain string.
    pub fn parse_pair(expr: &str) -> Result<(String, Value), LiveEventsError> {
        let (key, raw) = expr
            .split_once('=')
            .ok_or_else(|| LiveEventsError::InvalidFilter(format!("expected key=value, got '{expr}'")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(LiveEventsError::InvalidFilter(format!(
                "empty key in '{expr}'"
            )));
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok((key.to_string(), value))
    }
}

fn strictly_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

impl FromIterator<(String, Value)> for ClientSideFilters {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Latest stats snapshot returned by the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub users_on_product: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Paused,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Paused => "paused",
            ConnectionState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Identifies which team's stream to subscribe to and how to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub team_id: u64,
    pub token: String,
}

// Keep the bearer token out of logs
impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("team_id", &self.team_id)
            .field("token", &"<redacted>")
            .finish()
    }
}
