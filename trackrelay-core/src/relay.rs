//! Relay: the long-lived context hosting the delivery pipeline
//!
//! Routes inbound messages to the pipeline and turns the named sync signal
//! into drains.

use std::sync::Arc;

use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RelayConfig};
use crate::delivery::{
    DeliveryPipeline, DrainReport, HttpTransport, RetryTrigger, SyncRegistrar, Transport,
};
use crate::error::Result;
use crate::queue::{EventQueue, QueueStore};
use crate::types::{event_name, source_tag, InboundMessage, RELAY_SOURCE};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Sent on the first attempt
    Delivered,
    /// First attempt failed; persisted (or dropped if the queue is down)
    Queued,
    /// A sync signal ran a drain
    Synced(DrainReport),
    /// Malformed or irrelevant input
    Ignored,
}

/// Hosts a [`DeliveryPipeline`] and its [`RetryTrigger`].
pub struct Relay {
    pipeline: Arc<DeliveryPipeline>,
    trigger: Arc<RetryTrigger>,
}

impl Relay {
    pub fn new(
        config: &RelayConfig,
        queue: Arc<dyn EventQueue>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let trigger = Arc::new(RetryTrigger::new(config.sync_tag.clone()));
        let pipeline = Arc::new(DeliveryPipeline::new(
            config,
            queue,
            transport,
            clock,
            trigger.clone(),
        ));
        Self { pipeline, trigger }
    }

    /// Wire up the production queue, HTTP transport and wall clock.
    ///
    /// A queue that fails to open degrades to best-effort delivery; only an
    /// invalid relay configuration is an error.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.relay)?;
        let queue = QueueStore::open_or_degrade(&config.queue_path());
        Ok(Self::new(
            &config.relay,
            Arc::new(queue),
            Arc::new(transport),
            Arc::new(SystemClock),
        ))
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    pub fn trigger(&self) -> &Arc<RetryTrigger> {
        &self.trigger
    }

    /// Restore the sync registration for events left by a previous run.
    ///
    /// Returns the number of queued events found.
    pub async fn activate(&self) -> usize {
        let pending = match self.pipeline.queue().len().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Error reading queue on activation");
                0
            }
        };
        if pending > 0 {
            tracing::info!(pending, "Queued events found, registering sync");
            self.trigger.register();
        }
        pending
    }

    /// Parse and handle one line of NDJSON input.
    pub async fn handle_line(&self, line: &str) -> MessageOutcome {
        let line = line.trim();
        if line.is_empty() {
            return MessageOutcome::Ignored;
        }
        match InboundMessage::parse(line) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable message");
                MessageOutcome::Ignored
            }
        }
    }

    pub async fn handle_message(&self, message: InboundMessage) -> MessageOutcome {
        match message {
            InboundMessage::Track {
                endpoint,
                tracking_data,
            } => self.handle_track(endpoint.as_deref(), tracking_data).await,
            InboundMessage::Sync { tag } => match self.on_sync(&tag).await {
                Some(report) => MessageOutcome::Synced(report),
                None => MessageOutcome::Ignored,
            },
        }
    }

    async fn handle_track(
        &self,
        endpoint: Option<&str>,
        tracking_data: Option<Value>,
    ) -> MessageOutcome {
        let mut payload = match tracking_data {
            Some(Value::Object(payload)) => payload,
            Some(_) => {
                tracing::warn!("Received tracking event whose data is not an object");
                return MessageOutcome::Ignored;
            }
            None => {
                tracing::warn!("Received tracking event with no data");
                return MessageOutcome::Ignored;
            }
        };

        tracing::info!(event = %event_name(&payload), "Processing event");

        // Empty or non-string labels are replaced too
        if source_tag(&payload).is_none() {
            payload.insert("source".to_string(), Value::String(RELAY_SOURCE.to_string()));
        }

        if self.pipeline.submit(endpoint, payload).await {
            MessageOutcome::Delivered
        } else {
            MessageOutcome::Queued
        }
    }

    /// Deliver a named signal. Only this relay's sync tag runs a drain.
    pub async fn on_sync(&self, tag: &str) -> Option<DrainReport> {
        if !self.trigger.matches(tag) {
            tracing::debug!(tag, "Ignoring unrelated sync signal");
            return None;
        }
        // The registration is satisfied by this drain
        self.trigger.take_registration();
        Some(self.pipeline.drain().await)
    }

    /// Fire the sync signal if a registration is pending.
    pub async fn tick(&self) -> Option<DrainReport> {
        if !self.trigger.take_registration() {
            return None;
        }
        let tag = self.trigger.tag().to_string();
        self.on_sync(&tag).await
    }
}
