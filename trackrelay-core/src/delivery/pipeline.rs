//! Delivery pipeline: immediate send, durable fallback, ordered resend.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::transport::Transport;
use super::trigger::{DrainGate, SyncRegistrar};
use super::{DeliveryStats, DrainReport};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::types::{
    endpoint_tag, event_name, EventRecord, NewRecord, Payload, RecordId, DEFAULT_ENDPOINT,
    RELAY_SOURCE,
};

/// Accepts events, delivers them, and owns the retry bookkeeping.
///
/// All collaborators are injected so tests can swap in fakes.
pub struct DeliveryPipeline {
    queue: Arc<dyn EventQueue>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registrar: Arc<dyn SyncRegistrar>,
    default_endpoint: String,
    relay: RelayConfig,
    gate: DrainGate,
    stats: Mutex<DeliveryStats>,
}

impl DeliveryPipeline {
    pub fn new(
        config: &RelayConfig,
        queue: Arc<dyn EventQueue>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        registrar: Arc<dyn SyncRegistrar>,
    ) -> Self {
        Self {
            queue,
            transport,
            clock,
            registrar,
            default_endpoint: endpoint_tag(Some(&config.default_endpoint), DEFAULT_ENDPOINT),
            relay: config.clone(),
            gate: DrainGate::default(),
            stats: Mutex::new(DeliveryStats::default()),
        }
    }

    /// The queue this pipeline falls back to
    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.queue
    }

    /// Snapshot of delivery statistics
    pub fn stats(&self) -> DeliveryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_stats(&self, update: impl FnOnce(&mut DeliveryStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Deliver `payload` to `endpoint` (default tag when `None`).
    ///
    /// Returns true if the collector accepted it right away. On failure the
    /// payload is queued for a later drain and false is returned; this never
    /// fails.
    pub async fn submit(&self, endpoint: Option<&str>, payload: Payload) -> bool {
        let tag = endpoint_tag(endpoint, &self.default_endpoint);
        let body = Value::Object(payload.clone());

        match self.transport.send(&tag, &body).await {
            Ok(()) => {
                self.record_stats(|s| s.delivered += 1);
                tracing::debug!(endpoint = %tag, "Event delivered");
                true
            }
            Err(e) => {
                tracing::warn!(endpoint = %tag, error = %e, "Network error sending tracking data");
                self.persist(payload).await;
                false
            }
        }
    }

    /// Queue a payload and register for the retry trigger. Failures are logged.
    async fn persist(&self, payload: Payload) {
        let name = event_name(&payload).to_string();
        let record = NewRecord::from_payload(payload, self.clock.now());

        match self.queue.enqueue(record).await {
            Ok(id) => {
                self.record_stats(|s| s.queued += 1);
                tracing::info!(id, event = %name, "Event stored for later retry");
                self.registrar.register();
            }
            Err(e) => {
                self.record_stats(|s| s.dropped += 1);
                tracing::error!(event = %name, error = %e, "Failed to store event for later");
            }
        }
    }

    /// Resend queued events oldest-first, then sweep out aged records.
    ///
    /// If a drain is already running, this only asks it to run once more
    /// when it finishes and returns a coalesced report immediately.
    pub async fn drain(&self) -> DrainReport {
        let Some(mut permit) = self.gate.try_begin() else {
            tracing::debug!("Drain already in flight, coalescing trigger");
            return DrainReport::default();
        };

        let mut report = DrainReport::default();
        loop {
            report.absorb(self.drain_pass().await);
            if !permit.next_pass() {
                break;
            }
            tracing::debug!("Re-running drain for trigger received mid-drain");
        }
        report
    }

    async fn drain_pass(&self) -> DrainReport {
        let mut report = DrainReport {
            passes: 1,
            ..Default::default()
        };

        let records = match self.queue.list_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Error reading queued events");
                Vec::new()
            }
        };
        tracing::info!(count = records.len(), "Syncing offline tracking events");

        match self.resend_in_order(&records).await {
            Ok(resent) => report.resent = resent,
            Err(stop) => {
                if stop.error.is_transient() {
                    tracing::warn!(
                        id = stop.id,
                        error = %stop.error,
                        "Resend failed, will retry later"
                    );
                } else {
                    tracing::error!(
                        id = stop.id,
                        error = %stop.error,
                        "Queue error during resend, stopping drain"
                    );
                }
                report.resent = stop.resent;
                report.stopped_at = Some(stop.id);
            }
        }

        report.aged_out = self.sweep().await;

        match self.queue.len().await {
            Ok(remaining) => {
                report.remaining = remaining;
                if remaining > 0 {
                    self.registrar.register();
                }
            }
            Err(e) => tracing::error!(error = %e, "Error counting queued events"),
        }

        self.record_stats(|s| {
            s.drain_passes += 1;
            s.resent += report.resent;
            s.aged_out += report.aged_out;
        });
        report
    }

    /// Resend each record in turn; the first failure ends the pass.
    async fn resend_in_order(&self, records: &[EventRecord]) -> std::result::Result<usize, Stop> {
        let mut resent = 0;
        for record in records {
            self.resend(record).await.map_err(|error| Stop {
                id: record.id,
                resent,
                error,
            })?;
            resent += 1;
        }
        Ok(resent)
    }

    async fn resend(&self, record: &EventRecord) -> Result<()> {
        let source = record.source.as_deref().unwrap_or(RELAY_SOURCE);
        self.queue.stamp_resent(record.id, source).await?;

        let stamped = record.stamped(source);
        self.transport
            .send(DEFAULT_ENDPOINT, &stamped.wire_body())
            .await?;

        self.queue.remove(record.id).await?;
        tracing::info!(id = record.id, event = %record.event_name(), "Successfully resent event");
        Ok(())
    }

    /// Remove records past the retention window. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.relay.retention_cutoff(self.clock.now());
        match self.queue.age_sweep(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, cutoff = %cutoff, "Cleaned up old events");
                }
                removed
            }
            Err(e) => {
                tracing::error!(error = %e, "Error cleaning up old events");
                0
            }
        }
    }
}

/// Why a drain pass ended early.
struct Stop {
    id: RecordId,
    resent: usize,
    error: Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::delivery::RetryTrigger;
    use crate::queue::QueueStore;
    use crate::types::format_timestamp;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Transport that fails whenever `fails` says so and logs every call.
    struct ScriptedTransport {
        fails: Box<dyn Fn(&Value) -> bool + Send + Sync>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedTransport {
        fn new(fails: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
            Self {
                fails: Box::new(fails),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn online() -> Self {
            Self::new(|_| false)
        }

        fn offline() -> Self {
            Self::new(|_| true)
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        fn sent_events(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|(_, body)| body["event"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, endpoint_tag: &str, body: &Value) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint_tag.to_string(), body.clone()));
            if (self.fails)(body) {
                Err(Error::Network("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        queue: Arc<QueueStore>,
        transport: Arc<ScriptedTransport>,
        trigger: Arc<RetryTrigger>,
        clock: Arc<FixedClock>,
        pipeline: DeliveryPipeline,
    }

    fn harness(transport: ScriptedTransport) -> Harness {
        let queue = Arc::new(QueueStore::open_in_memory().unwrap());
        let transport = Arc::new(transport);
        let trigger = Arc::new(RetryTrigger::new("tracking-sync"));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let pipeline = DeliveryPipeline::new(
            &RelayConfig::default(),
            queue.clone(),
            transport.clone(),
            clock.clone(),
            trigger.clone(),
        );
        Harness {
            queue,
            transport,
            trigger,
            clock,
            pipeline,
        }
    }

    fn event(name: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("event".to_string(), json!(name));
        payload.insert("websiteId".to_string(), json!("site-1"));
        payload
    }

    fn event_at(name: &str, at: chrono::DateTime<Utc>) -> Payload {
        let mut payload = event(name);
        payload.insert("timestamp".to_string(), json!(format_timestamp(at)));
        payload
    }

    async fn queued_ids(queue: &QueueStore) -> Vec<RecordId> {
        queue
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[tokio::test]
    async fn test_submit_online_delivers_without_queueing() {
        let h = harness(ScriptedTransport::online());

        assert!(h.pipeline.submit(Some("pageview"), event("view")).await);
        assert!(h.pipeline.submit(None, event("click")).await);

        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(!h.trigger.is_pending());
        let tags: Vec<_> = h.transport.calls().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, vec!["pageview", "event"]);
        assert_eq!(h.pipeline.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_submit_offline_queues_exactly_one() {
        let h = harness(ScriptedTransport::offline());

        assert!(!h.pipeline.submit(None, event("a")).await);
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert!(!h.pipeline.submit(None, event("b")).await);
        assert_eq!(h.queue.len().await.unwrap(), 2);

        let ids = queued_ids(&h.queue).await;
        assert!(ids[1] > ids[0]);
        assert!(h.trigger.is_pending());
        assert_eq!(h.pipeline.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_submit_stamps_creation_time_from_clock() {
        let h = harness(ScriptedTransport::offline());
        h.pipeline.submit(None, event("untimed")).await;

        let records = h.queue.list_all().await.unwrap();
        assert_eq!(records[0].timestamp, "2025-06-01T12:00:00.000Z");
        assert!(!records[0].resent);
    }

    #[tokio::test]
    async fn test_submit_with_unavailable_store_drops() {
        let transport = Arc::new(ScriptedTransport::offline());
        let trigger = Arc::new(RetryTrigger::new("tracking-sync"));
        let pipeline = DeliveryPipeline::new(
            &RelayConfig::default(),
            Arc::new(QueueStore::unavailable()),
            transport,
            Arc::new(crate::clock::SystemClock),
            trigger.clone(),
        );

        assert!(!pipeline.submit(None, event("lost")).await);
        assert!(!trigger.is_pending());
        assert_eq!(pipeline.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let h = harness(ScriptedTransport::offline());
        for name in ["e1", "e2", "e3"] {
            h.pipeline.submit(None, event(name)).await;
        }
        assert_eq!(queued_ids(&h.queue).await, vec![1, 2, 3]);

        // Back online except for e2
        let transport = Arc::new(ScriptedTransport::new(|body| body["event"] == "e2"));
        let pipeline = DeliveryPipeline::new(
            &RelayConfig::default(),
            h.queue.clone(),
            transport.clone(),
            h.clock.clone(),
            h.trigger.clone(),
        );

        let report = pipeline.drain().await;

        assert_eq!(queued_ids(&h.queue).await, vec![2, 3]);
        assert_eq!(transport.sent_events(), vec!["e1", "e2"]);
        assert_eq!(report.resent, 1);
        assert_eq!(report.stopped_at, Some(2));
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn test_drain_resends_to_event_tag_with_bookkeeping() {
        let h = harness(ScriptedTransport::new(|body| body["resent"] != true));
        h.pipeline.submit(Some("funnel"), event("step")).await;

        h.pipeline.drain().await;

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "funnel");
        assert_eq!(calls[1].0, "event");
        assert_eq!(calls[1].1["source"], "relay");
        assert_eq!(calls[1].1["resent"], true);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_never_overwrites_source() {
        let h = harness(ScriptedTransport::offline());
        let mut payload = event("click");
        payload.insert("source".to_string(), json!("checkout-widget"));
        h.pipeline.submit(None, payload).await;

        h.pipeline.drain().await;

        let records = h.queue.list_all().await.unwrap();
        assert_eq!(records[0].source.as_deref(), Some("checkout-widget"));
        assert!(records[0].resent);
        let (_, body) = h.transport.calls().pop().unwrap();
        assert_eq!(body["source"], "checkout-widget");
    }

    #[tokio::test]
    async fn test_delivered_records_are_not_resent_again() {
        let h = harness(ScriptedTransport::new(|body| body["resent"] != true));
        h.pipeline.submit(None, event("once")).await;

        h.pipeline.drain().await;
        h.pipeline.drain().await;
        h.pipeline.drain().await;

        // One failed first attempt, one successful resend
        assert_eq!(h.transport.calls().len(), 2);
        assert_eq!(h.pipeline.stats().resent, 1);
    }

    #[tokio::test]
    async fn test_drain_ages_out_despite_resend_failure() {
        let h = harness(ScriptedTransport::offline());
        let ten_days_ago = h.clock.now() - Duration::days(10);
        h.pipeline.submit(None, event_at("stale", ten_days_ago)).await;

        let report = h.pipeline.drain().await;

        assert_eq!(report.stopped_at, Some(1));
        assert_eq!(report.aged_out, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_boundary_around_retention() {
        let h = harness(ScriptedTransport::offline());
        let now = h.clock.now();
        h.pipeline
            .submit(None, event_at("eight", now - Duration::days(8)))
            .await;
        h.pipeline
            .submit(None, event_at("six", now - Duration::days(6)))
            .await;

        assert_eq!(h.pipeline.sweep().await, 1);
        let names: Vec<_> = h
            .queue
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.event_name().to_string())
            .collect();
        assert_eq!(names, vec!["six"]);
    }

    #[tokio::test]
    async fn test_record_ages_out_once_clock_passes_retention() {
        let h = harness(ScriptedTransport::offline());
        h.pipeline.submit(None, event("waiting")).await;

        h.clock.advance(Duration::days(6));
        assert_eq!(h.pipeline.drain().await.aged_out, 0);

        h.clock.advance(Duration::days(2));
        let report = h.pipeline.drain().await;
        assert_eq!(report.aged_out, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_drain_with_unbounded_retention_keeps_records() {
        let queue = Arc::new(QueueStore::open_in_memory().unwrap());
        let config = RelayConfig {
            retention_days: u32::MAX,
            ..Default::default()
        };
        let pipeline = DeliveryPipeline::new(
            &config,
            queue.clone(),
            Arc::new(ScriptedTransport::offline()),
            Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            )),
            Arc::new(RetryTrigger::new("tracking-sync")),
        );
        pipeline.submit(None, event("kept")).await;

        let report = pipeline.drain().await;
        assert_eq!(report.aged_out, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(pipeline.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_drain_reregisters_while_records_remain() {
        let h = harness(ScriptedTransport::offline());
        h.pipeline.submit(None, event("stuck")).await;
        assert!(h.trigger.take_registration());

        h.pipeline.drain().await;
        assert!(h.trigger.is_pending());
    }

    /// First send blocks until released; tracks concurrent sends.
    struct GatedTransport {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl GatedTransport {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, _endpoint_tag: &str, _body: &Value) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_trigger_during_drain_runs_exactly_one_more_pass() {
        let queue = Arc::new(QueueStore::open_in_memory().unwrap());
        let clock = Arc::new(crate::clock::SystemClock);
        queue
            .enqueue(NewRecord::from_payload(event("e1"), clock.now()))
            .await
            .unwrap();

        let transport = Arc::new(GatedTransport::new());
        let trigger = Arc::new(RetryTrigger::new("tracking-sync"));
        let pipeline = Arc::new(DeliveryPipeline::new(
            &RelayConfig::default(),
            queue.clone(),
            transport.clone(),
            clock.clone(),
            trigger,
        ));

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.drain().await }
        });
        transport.entered.notified().await;

        // Two signals while the first send is pending
        assert!(pipeline.drain().await.coalesced());
        assert!(pipeline.drain().await.coalesced());
        queue
            .enqueue(NewRecord::from_payload(event("e2"), clock.now()))
            .await
            .unwrap();

        transport.release.notify_one();
        let report = first.await.unwrap();

        assert_eq!(report.passes, 2);
        assert_eq!(report.resent, 2);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stats().drain_passes, 2);
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
