use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, OnceLock, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    batcher::{Batcher, BatcherConfig},
    config::ClientConfig,
    deliverer::{Deliverer, DeliveryOutcome, DeliverySnapshot},
    error::{Result, TelemetryError, ValidationError},
    export::EventLog,
    prefs::{OPT_IN_KEY, PreferenceStore},
    record::{
        Category, EventRecord, KEY_DELIMITER, NewEvent, Payload, PayloadValue, Session,
        validate_segment,
    },
    spool::{CompactionStats, Spool},
    taxonomy::{Acquisition, Flow, MatchEvent, Resource, Source},
    transport::Transport,
};

/// Totals for one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub acknowledged: usize,
    pub requeued: usize,
    pub failed_batches: usize,
}

impl FlushReport {
    fn add(&mut self, outcome: &DeliveryOutcome) {
        self.batches += 1;
        match *outcome {
            DeliveryOutcome::Delivered { acknowledged, .. } => self.acknowledged += acknowledged,
            DeliveryOutcome::Partial {
                acknowledged,
                requeued,
                ..
            } => {
                self.acknowledged += acknowledged;
                self.requeued += requeued;
            }
            DeliveryOutcome::Failed { requeued, .. } | DeliveryOutcome::Cancelled { requeued, .. } => {
                self.failed_batches += 1;
                self.requeued += requeued;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.requeued == 0 && self.failed_batches == 0
    }
}

/// Everything that exists only after `init`.
struct Active {
    config: ClientConfig,
    runtime: Handle,
    spool: Arc<Spool>,
    batcher: Arc<Batcher>,
    deliverer: Arc<Deliverer>,
    log: EventLog,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Session-scoped telemetry façade.
///
/// Owns the opt-in gate and every piece of session state. Build one per
/// process and hand out references.
pub struct TelemetryClient {
    prefs: Arc<dyn PreferenceStore>,
    transport: Arc<dyn Transport>,
    active: OnceLock<Active>,
    init_lock: Mutex<()>,
    opted_in: Arc<AtomicBool>,
    shut_down: AtomicBool,
    namespace: RwLock<Vec<String>>,
}

impl TelemetryClient {
    pub fn new(prefs: Arc<dyn PreferenceStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            prefs,
            transport,
            active: OnceLock::new(),
            init_lock: Mutex::new(()),
            opted_in: Arc::new(AtomicBool::new(false)),
            shut_down: AtomicBool::new(false),
            namespace: RwLock::new(Vec::new()),
        }
    }

    /// One-time session setup. Must run inside a tokio runtime.
    ///
    /// A second call is rejected with [`TelemetryError::Reinitialization`]
    /// and leaves the running session untouched.
    pub fn init(&self, config: ClientConfig) -> Result<()> {
        let _guard = self.init_lock.lock().expect("init lock poisoned");
        if self.active.get().is_some() {
            warn!("Telemetry client initialized twice, ignoring");
            return Err(TelemetryError::Reinitialization);
        }
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| TelemetryError::Config("init requires a tokio runtime".into()))?;

        let opted_in = match self.prefs.get_bool(OPT_IN_KEY) {
            Some(value) => value,
            None => {
                if let Err(e) = self.prefs.set_bool(OPT_IN_KEY, true) {
                    warn!(error = %e, "Failed to persist default opt-in");
                }
                true
            }
        };
        self.opted_in.store(opted_in, Ordering::Release);

        let session = Session::new();
        let spool = match Spool::open(
            &config.spool_dir,
            config.spool_compaction_threshold,
            session.clone(),
        ) {
            Ok(spool) => spool,
            Err(e) => {
                warn!(
                    dir = %config.spool_dir.display(),
                    error = %e,
                    "Spool unavailable, buffering in memory only"
                );
                Spool::in_memory(session.clone())
            }
        };
        let spool = Arc::new(spool);

        let batcher = Arc::new(Batcher::new(BatcherConfig::from(&config)));
        batcher.seed(spool.pending());

        let cancel = CancellationToken::new();
        let deliverer = Arc::new(Deliverer::new(
            Arc::clone(&self.transport),
            Arc::clone(&spool),
            Arc::clone(&batcher),
            &config,
            cancel.clone(),
        ));

        let pump = {
            let deliverer = Arc::clone(&deliverer);
            let handle = runtime.clone();
            runtime.spawn(Arc::clone(&batcher).run(
                move |batch| {
                    deliverer.dispatch(&handle, batch);
                },
                Arc::clone(&self.opted_in),
                cancel.clone(),
            ))
        };

        info!(
            session_id = %session.id,
            opted_in,
            durable = spool.is_durable(),
            pending = spool.pending_count(),
            "Telemetry client initialized"
        );

        let active = Active {
            config,
            runtime,
            spool,
            batcher,
            deliverer,
            log: EventLog::new(),
            cancel,
            pump: Mutex::new(Some(pump)),
        };
        if self.active.set(active).is_err() {
            return Err(TelemetryError::Reinitialization);
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.active.get().is_some()
    }

    /// Whether events are currently collected. False before `init`.
    pub fn opted_in(&self) -> bool {
        self.is_ready() && self.opted_in.load(Ordering::Acquire)
    }

    /// Change the opt-in flag and persist it.
    pub fn set_opt_in(&self, value: bool) -> Result<()> {
        self.opted_in.store(value, Ordering::Release);
        debug!(opted_in = value, "Opt-in changed");
        if value && let Some(active) = self.active.get() {
            active.batcher.wake();
        }
        self.prefs.set_bool(OPT_IN_KEY, value)
    }

    /// Replace the context prefix prepended to every key (e.g. scene, mode).
    pub fn set_namespace<I, S>(&self, segments: I) -> std::result::Result<(), ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        *self.namespace.write().expect("namespace poisoned") = segments;
        Ok(())
    }

    pub fn namespace(&self) -> Vec<String> {
        self.namespace.read().expect("namespace poisoned").clone()
    }

    /// Record one event. Returns its sequence id, or `None` when the client
    /// is not collecting (not ready, opted out, or shut down).
    pub fn record(&self, category: Category, key: &str, payload: Payload) -> Result<Option<u64>> {
        let key = self.compose_key(&[key])?;
        let event = NewEvent::new(category, key, payload)?;
        Ok(self.emit(event))
    }

    pub fn record_metric(&self, key: &str, value: f64) -> Result<Option<u64>> {
        self.record(Category::Metric, key, value_payload(value))
    }

    /// Record a 2D sample as an `x` and a `y` record sharing a correlation id.
    pub fn record_positional(&self, key: &str, x: f64, y: f64) -> Result<Option<Uuid>> {
        let correlation = Uuid::new_v4();
        let mut events = Vec::with_capacity(2);
        for (axis, value) in [("x", x), ("y", y)] {
            let mut payload = value_payload(value);
            payload.insert(
                "correlation_id".to_string(),
                PayloadValue::Text(correlation.to_string()),
            );
            let key = self.compose_key(&[key, axis])?;
            events.push(NewEvent::new(Category::Positional, key, payload)?);
        }

        if !self.collecting() {
            return Ok(None);
        }
        for event in events {
            self.emit(event);
        }
        Ok(Some(correlation))
    }

    pub fn record_match(&self, event: MatchEvent, score: f64) -> Result<Option<u64>> {
        let payload = Payload::from([
            ("status".to_string(), PayloadValue::from(event.status())),
            ("score".to_string(), PayloadValue::Number(score)),
        ]);
        self.record(Category::Progression, event.as_str(), payload)
    }

    /// Record a resource gain (positive) or loss (negative). Zero is ignored.
    pub fn record_resource(
        &self,
        resource: Resource,
        amount: f64,
        how: Acquisition,
        from: Source,
    ) -> Result<Option<u64>> {
        if amount == 0.0 {
            return Ok(None);
        }
        let payload = Payload::from([
            ("amount".to_string(), PayloadValue::Number(amount)),
            ("flow".to_string(), PayloadValue::from(Flow::of(amount).as_str())),
            ("how".to_string(), PayloadValue::from(how.as_str())),
            ("from".to_string(), PayloadValue::from(from.as_str())),
        ]);
        self.record(Category::Resource, resource.as_str(), payload)
    }

    /// Cut everything queued into batches and deliver them now, in order,
    /// after any batches already in flight.
    pub async fn flush(&self) -> FlushReport {
        match self.active.get() {
            Some(active) if self.collecting() => self.flush_active(active).await,
            _ => FlushReport::default(),
        }
    }

    /// Stop collecting, cancel background work and make one bounded final
    /// delivery attempt. Later calls are no-ops.
    pub async fn shutdown(&self) -> FlushReport {
        let Some(active) = self.active.get() else {
            return FlushReport::default();
        };
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }

        active.cancel.cancel();
        let pump = active.pump.lock().expect("pump handle poisoned").take();
        if let Some(pump) = pump
            && let Err(e) = pump.await
        {
            warn!(error = %e, "Batcher pump ended abnormally");
        }

        let mut report = FlushReport::default();
        if self.opted_in.load(Ordering::Acquire) {
            match tokio::time::timeout(active.config.shutdown_timeout, self.flush_active(active))
                .await
            {
                Ok(r) => report = r,
                Err(_) => warn!(
                    timeout_ms = active.config.shutdown_timeout.as_millis() as u64,
                    "Final flush timed out, records stay spooled"
                ),
            }
        }

        if let Err(e) = active.spool.compact() {
            warn!(error = %e, "Spool compaction at shutdown failed");
        }

        info!(
            acknowledged = report.acknowledged,
            pending = active.spool.pending_count(),
            "Telemetry client shut down"
        );
        report
    }

    /// Records not yet acknowledged by the collector, ascending id.
    pub fn pending(&self) -> Vec<EventRecord> {
        self.active
            .get()
            .map(|a| a.spool.pending())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.active
            .get()
            .map(|a| a.spool.pending_count())
            .unwrap_or(0)
    }

    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        match self.active.get() {
            Some(active) => active.spool.compact().map(Some),
            None => Ok(None),
        }
    }

    /// Write this session's `key,value` log to a new CSV file under `dir`.
    pub fn export_csv(&self, dir: &Path) -> Result<Option<PathBuf>> {
        match self.active.get() {
            Some(active) => active.log.export(dir, active.spool.session()),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.active
            .get()
            .map(|a| a.deliverer.stats())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.active.get().map(|a| a.spool.session().id)
    }

    pub fn is_durable(&self) -> bool {
        self.active.get().is_some_and(|a| a.spool.is_durable())
    }

    fn collecting(&self) -> bool {
        self.is_ready()
            && self.opted_in.load(Ordering::Acquire)
            && !self.shut_down.load(Ordering::Acquire)
    }

    fn compose_key(&self, tail: &[&str]) -> std::result::Result<String, ValidationError> {
        for segment in tail {
            validate_segment(segment)?;
        }
        let namespace = self.namespace.read().expect("namespace poisoned");
        let delimiter = KEY_DELIMITER.to_string();
        Ok(namespace
            .iter()
            .map(String::as_str)
            .chain(tail.iter().copied())
            .collect::<Vec<_>>()
            .join(&delimiter))
    }

    fn emit(&self, event: NewEvent) -> Option<u64> {
        if !self.collecting() {
            return None;
        }
        let active = self.active.get()?;

        let record = match active.spool.append(event) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    id = e.record.id,
                    error = %e.source,
                    "Spool write failed, continuing in memory"
                );
                *e.record
            }
        };
        let id = record.id;
        trace!(id, key = %record.key, category = %record.category, "Recorded event");

        active.log.push(&record);
        let _handoff = active.batcher.handoff();
        if let Some(batch) = active.batcher.push(record) {
            active.deliverer.dispatch(&active.runtime, batch);
        }
        Some(id)
    }

    /// Deliver everything already handed to the deliverer, then everything
    /// still queued, in record order. The work runs on its own task, so
    /// dropping this future does not abandon drained batches.
    async fn flush_active(&self, active: &Active) -> FlushReport {
        let task = {
            let _handoff = active.batcher.handoff();
            let earlier = active.deliverer.take_in_flight();
            let batches = active.batcher.drain_all();
            if earlier.is_empty() && batches.is_empty() {
                return FlushReport::default();
            }
            active
                .deliverer
                .deliver_in_order(&active.runtime, earlier, batches)
        };

        let mut report = FlushReport::default();
        match task.await {
            Ok(outcomes) => outcomes.iter().for_each(|o| report.add(o)),
            Err(e) => warn!(error = %e, "Flush task ended abnormally"),
        }
        debug!(
            batches = report.batches,
            acknowledged = report.acknowledged,
            requeued = report.requeued,
            "Flush finished"
        );
        report
    }
}

fn value_payload(value: f64) -> Payload {
    Payload::from([("value".to_string(), PayloadValue::Number(value))])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::DeliveryError,
        prefs::MemoryPreferences,
        transport::{SCHEMA_VERSION, WireAck, WireBatch},
    };

    #[derive(Default)]
    struct Recorder {
        keys: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, batch: &WireBatch) -> std::result::Result<WireAck, DeliveryError> {
            self.keys
                .lock()
                .unwrap()
                .extend(batch.records.iter().map(|r| r.key.clone()));
            Ok(WireAck {
                schema_version: SCHEMA_VERSION,
                batch_id: batch.batch_id,
                accepted: batch.records.iter().map(|r| r.id).collect(),
            })
        }
    }

    fn config(dir: &Path) -> ClientConfig {
        ClientConfig {
            spool_dir: dir.to_path_buf(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_init_outside_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = TelemetryClient::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(Recorder::default()),
        );
        let err = client.init(config(dir.path())).unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_not_ready_is_silent() {
        let client = TelemetryClient::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(Recorder::default()),
        );
        assert!(!client.opted_in());
        assert_eq!(client.record_metric("fps", 60.0).unwrap(), None);
        assert_eq!(client.flush().await, FlushReport::default());
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_prefixes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Recorder::default());
        let client = TelemetryClient::new(Arc::new(MemoryPreferences::new()), transport.clone());
        client.init(config(dir.path())).unwrap();

        client.set_namespace(["arena", "multiplayer"]).unwrap();
        client.record_metric("kills", 3.0).unwrap();
        client.record_match(MatchEvent::Win, 42.0).unwrap();
        client.flush().await;

        assert_eq!(
            *transport.keys.lock().unwrap(),
            vec!["arena:multiplayer:kills", "arena:multiplayer:match_win"]
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = TelemetryClient::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(Recorder::default()),
        );
        client.init(config(dir.path())).unwrap();

        let err = client.record_metric("a:b", 1.0).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::Validation(ValidationError::ReservedDelimiter { .. })
        ));
        assert!(matches!(
            client.record_metric(" ", 1.0).unwrap_err(),
            TelemetryError::Validation(ValidationError::EmptyKey)
        ));
        assert!(client.set_namespace(["ok", ""]).is_err());
        assert!(client.pending().is_empty());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_resource_payload_and_zero_amount() {
        let dir = tempfile::tempdir().unwrap();
        let client = TelemetryClient::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(Recorder::default()),
        );
        client.init(config(dir.path())).unwrap();

        let none = client
            .record_resource(Resource::Iridium, 0.0, Acquisition::Found, Source::UnitGenerated)
            .unwrap();
        assert_eq!(none, None);

        client
            .record_resource(Resource::Favor, -5.0, Acquisition::Sold, Source::NpcGenerated)
            .unwrap()
            .unwrap();
        let pending = client.pending();
        assert_eq!(pending.len(), 1);
        let payload = &pending[0].payload;
        assert_eq!(pending[0].key, "favor");
        assert_eq!(payload["flow"], PayloadValue::from("sink"));
        assert_eq!(payload["how"], PayloadValue::from("sold"));
        assert_eq!(payload["from"], PayloadValue::from("npc_generated"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_report_counts() {
        let dir = tempfile::tempdir().unwrap();
        let client = TelemetryClient::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(Recorder::default()),
        );
        client
            .init(ClientConfig {
                max_batch_size: 2,
                ..config(dir.path())
            })
            .unwrap();
        client.record_metric("a", 1.0).unwrap();

        let report = client.flush().await;
        assert!(report.is_complete());
        assert_eq!(report.acknowledged, 1);
        assert_eq!(client.stats().records_acknowledged, 1);
        client.shutdown().await;
    }
}
