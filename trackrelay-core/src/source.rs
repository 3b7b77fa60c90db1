//! Event payload builders
//!
//! Builds the payload shapes a page-side tracker produces (page views,
//! custom events, funnel steps, session heartbeats) and wraps them as
//! inbound `track` messages for the relay.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::{format_timestamp, InboundMessage, Payload};

/// Generate a random visitor/session identifier
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identity shared by every event from one page session.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    pub website_id: String,
    pub visitor_id: String,
    pub session_id: String,
}

impl TrackingContext {
    /// New session for `website_id` with fresh visitor and session ids
    pub fn new(website_id: impl Into<String>) -> Self {
        Self {
            website_id: website_id.into(),
            visitor_id: generate_id(),
            session_id: generate_id(),
        }
    }

    /// Reuse a persisted visitor id
    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = visitor_id.into();
        self
    }

    fn base(&self, endpoint: &'static str) -> TrackEvent {
        let mut payload = Payload::new();
        payload.insert("websiteId".to_string(), json!(self.website_id));
        payload.insert("visitorId".to_string(), json!(self.visitor_id));
        payload.insert("sessionId".to_string(), json!(self.session_id));
        payload.insert("timestamp".to_string(), json!(format_timestamp(Utc::now())));
        TrackEvent { endpoint, payload }
    }

    pub fn page_view(&self, url: &str, path: &str) -> TrackEvent {
        self.base("pageview")
            .with_field("url", json!(url))
            .with_field("path", json!(path))
    }

    pub fn custom(&self, name: &str, url: &str, path: &str) -> TrackEvent {
        self.base("event")
            .with_field("event", json!(name))
            .with_field("url", json!(url))
            .with_field("path", json!(path))
            .with_field("properties", json!({}))
    }

    pub fn funnel_step(&self, step: &str, url: &str, path: &str) -> TrackEvent {
        self.base("funnel")
            .with_field("event", json!("funnel_step"))
            .with_field("funnelStep", json!(step))
            .with_field("url", json!(url))
            .with_field("path", json!(path))
            .with_field("properties", json!({}))
    }

    pub fn session_heartbeat(&self, duration_secs: u64, path: &str) -> TrackEvent {
        self.base("session")
            .with_field("sessionDuration", json!(duration_secs))
            .with_field("path", json!(path))
    }
}

/// A built event and the endpoint tag it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEvent {
    endpoint: &'static str,
    payload: Payload,
}

impl TrackEvent {
    fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_title(self, title: &str) -> Self {
        self.with_field("title", json!(title))
    }

    pub fn with_referrer(self, referrer: &str) -> Self {
        self.with_field("referrer", json!(referrer))
    }

    pub fn with_timestamp(self, at: DateTime<Utc>) -> Self {
        self.with_field("timestamp", json!(format_timestamp(at)))
    }

    /// Add one entry under `properties`
    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        let properties = self
            .payload
            .entry("properties")
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = properties {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Merge a whole properties object
    pub fn with_properties(self, properties: Payload) -> Self {
        properties
            .into_iter()
            .fold(self, |event, (key, value)| event.with_property(&key, value))
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Wrap as an inbound `track` message
    pub fn into_message(self) -> InboundMessage {
        InboundMessage::Track {
            endpoint: Some(self.endpoint.to_string()),
            tracking_data: Some(Value::Object(self.payload)),
        }
    }
}
