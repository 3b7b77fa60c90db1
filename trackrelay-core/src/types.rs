//! Core domain types for trackrelay
//!
//! An [`EventRecord`] is the unit of durability: a payload that failed
//! immediate delivery, persisted until a resend succeeds or it ages out.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Opaque event attributes (event name, website id, visitor/session ids, URL, ...)
pub type Payload = serde_json::Map<String, Value>;

/// Queue-assigned record identifier
pub type RecordId = i64;

/// Source tag stamped on events that reach the relay without one
pub const RELAY_SOURCE: &str = "relay";

/// Endpoint tag used for resends and when a message names none
pub const DEFAULT_ENDPOINT: &str = "event";

// ============================================
// Event records
// ============================================

/// A queued event awaiting resend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique, monotonically increasing, never reused
    pub id: RecordId,
    /// Event attributes exactly as submitted
    pub payload: Payload,
    /// ISO-8601 creation time, used by the aging sweep
    pub timestamp: String,
    /// Originating context; set once
    pub source: Option<String>,
    /// True once the record has gone through a resend attempt
    pub resent: bool,
}

impl EventRecord {
    /// Event name for log lines (`eventName`, then `event`)
    pub fn event_name(&self) -> &str {
        event_name(&self.payload)
    }

    /// Copy of this record with `source` filled in (if absent) and `resent` set.
    pub fn stamped(&self, source: &str) -> Self {
        let mut record = self.clone();
        if record.source.is_none() {
            record.source = Some(source.to_string());
        }
        record.resent = true;
        record
    }

    /// JSON body sent to the collector: the payload plus `source` and `resent`.
    pub fn wire_body(&self) -> Value {
        let mut body = self.payload.clone();
        if let Some(source) = &self.source {
            body.insert("source".to_string(), Value::String(source.clone()));
        }
        body.insert("resent".to_string(), Value::Bool(self.resent));
        Value::Object(body)
    }
}

/// A record about to be inserted; the queue assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub payload: Payload,
    pub timestamp: String,
    pub source: Option<String>,
}

impl NewRecord {
    /// Build a record for `payload` created at `now`.
    ///
    /// The payload's own string `timestamp` wins over `now`, so aging
    /// measures from when the event happened. `source` is lifted from the
    /// payload when present.
    pub fn from_payload(payload: Payload, now: DateTime<Utc>) -> Self {
        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format_timestamp(now));
        let source = source_tag(&payload).map(str::to_string);

        Self {
            payload,
            timestamp,
            source,
        }
    }
}

/// Event name for log lines, falling back to "unnamed event"
pub fn event_name(payload: &Payload) -> &str {
    payload
        .get("eventName")
        .or_else(|| payload.get("event"))
        .and_then(Value::as_str)
        .unwrap_or("unnamed event")
}

/// The payload's `source` label, if it carries a usable one.
///
/// Only a non-empty string counts. An empty string, `null` or a non-string
/// value (a number, an object) is treated as absent.
pub fn source_tag(payload: &Payload) -> Option<&str> {
    payload
        .get("source")
        .and_then(Value::as_str)
        .filter(|source| !source.is_empty())
}

/// Format a time the way browsers' `toISOString` does.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Normalize an endpoint tag: strip surrounding slashes, fall back to `default`.
pub fn endpoint_tag(requested: Option<&str>, default: &str) -> String {
    let tag = requested.map(|t| t.trim().trim_matches('/')).unwrap_or("");
    if tag.is_empty() {
        default.to_string()
    } else {
        tag.to_string()
    }
}

// ============================================
// Inbound messages
// ============================================

/// Message from an event source, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Deliver `trackingData` to `{base}/{endpoint}`
    Track {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(rename = "trackingData", default, skip_serializing_if = "Option::is_none")]
        tracking_data: Option<Value>,
    },
    /// Host-delivered retry signal
    Sync { tag: String },
}

impl InboundMessage {
    /// Parse one line of input
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::MalformedInput(e.to_string()))
    }
}
