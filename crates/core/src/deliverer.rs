use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use tokio::{runtime::Handle, sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    batcher::Batcher,
    config::ClientConfig,
    error::DeliveryError,
    record::{Batch, EventRecord},
    spool::Spool,
    transport::{SCHEMA_VERSION, Transport, WireAck, WireBatch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

impl RetryPolicy {
    /// Exponential ceiling for `attempt` (0-based), capped at `max_delay`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Equal jitter: half the ceiling plus a random share of the other half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        batch_id: Uuid,
        acknowledged: usize,
    },
    Partial {
        batch_id: Uuid,
        acknowledged: usize,
        requeued: usize,
    },
    Failed {
        batch_id: Uuid,
        attempts: u32,
        requeued: usize,
    },
    Cancelled {
        batch_id: Uuid,
        requeued: usize,
    },
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub batches_delivered: AtomicU64,
    pub batches_failed: AtomicU64,
    pub records_acknowledged: AtomicU64,
    pub records_requeued: AtomicU64,
    pub retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub records_acknowledged: u64,
    pub records_requeued: u64,
    pub retries: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_acknowledged: self.records_acknowledged.load(Ordering::Relaxed),
            records_requeued: self.records_requeued.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// A spawned delivery task; yields one outcome per batch it carried.
pub type DeliveryTask = JoinHandle<Vec<DeliveryOutcome>>;

/// Sends batches to the collector and settles their records in the spool.
pub struct Deliverer {
    transport: Arc<dyn Transport>,
    spool: Arc<Spool>,
    batcher: Arc<Batcher>,
    policy: RetryPolicy,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: DeliveryStats,
    in_flight: Mutex<Vec<DeliveryTask>>,
}

impl Deliverer {
    pub fn new(
        transport: Arc<dyn Transport>,
        spool: Arc<Spool>,
        batcher: Arc<Batcher>,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            spool,
            batcher,
            policy: RetryPolicy::from(config),
            request_timeout: config.request_timeout,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            cancel,
            stats: DeliveryStats::default(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }

    /// Deliver `batch` on its own task. Callable from threads outside the
    /// runtime. The task stays tracked until [`take_in_flight`] collects it.
    ///
    /// [`take_in_flight`]: Deliverer::take_in_flight
    pub fn dispatch(self: &Arc<Self>, runtime: &Handle, batch: Batch) {
        let task = self.deliver_in_order(runtime, Vec::new(), vec![batch]);
        let mut in_flight = self.in_flight.lock().expect("in-flight poisoned");
        in_flight.retain(|t| !t.is_finished());
        in_flight.push(task);
    }

    /// Spawn one task that waits for `after`, then delivers `batches` one
    /// after another. Dropping the returned handle does not stop it.
    pub fn deliver_in_order(
        self: &Arc<Self>,
        runtime: &Handle,
        after: Vec<DeliveryTask>,
        batches: Vec<Batch>,
    ) -> DeliveryTask {
        let this = Arc::clone(self);
        runtime.spawn(async move {
            let mut outcomes = join_tasks(after).await;
            for batch in batches {
                outcomes.push(this.deliver(batch).await);
            }
            outcomes
        })
    }

    /// Hand over every task started by `dispatch` and not yet collected, in
    /// dispatch order.
    pub fn take_in_flight(&self) -> Vec<DeliveryTask> {
        std::mem::take(&mut *self.in_flight.lock().expect("in-flight poisoned"))
    }

    /// Send one batch, retrying with backoff. Records that are not accepted
    /// go back to the batcher; nothing is dropped.
    pub async fn deliver(&self, batch: Batch) -> DeliveryOutcome {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return self.requeue_cancelled(batch);
        };

        let wire = WireBatch::from_batch(&batch);
        let mut attempt = 0u32;

        loop {
            match self.send_once(&wire).await {
                Ok(ack) => return self.settle(batch, ack),
                Err(e) => {
                    warn!(
                        batch_id = %batch.id,
                        records = batch.len(),
                        attempt,
                        error = %e,
                        "Batch delivery failed"
                    );
                }
            }

            if attempt >= self.policy.max_retries {
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                let requeued = self.requeue(batch.records);
                warn!(
                    batch_id = %batch.id,
                    attempts = attempt + 1,
                    requeued,
                    "Retries exhausted, records left for next cycle"
                );
                return DeliveryOutcome::Failed {
                    batch_id: batch.id,
                    attempts: attempt + 1,
                    requeued,
                };
            }

            let delay = self.policy.backoff(attempt);
            attempt += 1;
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                batch_id = %batch.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.requeue_cancelled(batch),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn send_once(&self, wire: &WireBatch) -> Result<WireAck, DeliveryError> {
        let ack = tokio::time::timeout(self.request_timeout, self.transport.send(wire))
            .await
            .map_err(|_| DeliveryError::Timeout(self.request_timeout))??;

        if ack.schema_version != SCHEMA_VERSION {
            return Err(DeliveryError::SchemaMismatch(ack.schema_version));
        }
        if ack.batch_id != wire.batch_id {
            return Err(DeliveryError::BatchMismatch {
                expected: wire.batch_id,
                got: ack.batch_id,
            });
        }
        Ok(ack)
    }

    fn settle(&self, batch: Batch, ack: WireAck) -> DeliveryOutcome {
        let accepted: BTreeSet<u64> = ack.accepted.into_iter().collect();
        let (acked, rest): (Vec<EventRecord>, Vec<EventRecord>) = batch
            .records
            .into_iter()
            .partition(|r| accepted.contains(&r.id));

        let acked_ids: Vec<u64> = acked.iter().map(|r| r.id).collect();
        if let Err(e) = self.spool.mark_acknowledged(&acked_ids) {
            warn!(batch_id = %batch.id, error = %e, "Failed to journal acknowledgment");
        }
        self.stats
            .records_acknowledged
            .fetch_add(acked_ids.len() as u64, Ordering::Relaxed);

        if self.spool.needs_compaction()
            && let Err(e) = self.spool.compact()
        {
            warn!(error = %e, "Spool compaction failed");
        }

        if rest.is_empty() {
            self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
            debug!(batch_id = %batch.id, records = acked_ids.len(), "Batch delivered");
            return DeliveryOutcome::Delivered {
                batch_id: batch.id,
                acknowledged: acked_ids.len(),
            };
        }

        let requeued = self.requeue(rest);
        debug!(
            batch_id = %batch.id,
            acknowledged = acked_ids.len(),
            requeued,
            "Batch partially accepted"
        );
        DeliveryOutcome::Partial {
            batch_id: batch.id,
            acknowledged: acked_ids.len(),
            requeued,
        }
    }

    fn requeue(&self, records: Vec<EventRecord>) -> usize {
        let n = records.len();
        self.stats
            .records_requeued
            .fetch_add(n as u64, Ordering::Relaxed);
        self.batcher.requeue(records);
        n
    }

    fn requeue_cancelled(&self, batch: Batch) -> DeliveryOutcome {
        let batch_id = batch.id;
        let requeued = self.requeue(batch.records);
        debug!(batch_id = %batch_id, requeued, "Delivery cancelled");
        DeliveryOutcome::Cancelled { batch_id, requeued }
    }
}

/// Await `tasks` in order and concatenate their outcomes.
pub async fn join_tasks(tasks: Vec<DeliveryTask>) -> Vec<DeliveryOutcome> {
    let mut outcomes = Vec::new();
    for task in tasks {
        match task.await {
            Ok(mut done) => outcomes.append(&mut done),
            Err(e) => warn!(error = %e, "Delivery task ended abnormally"),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        batcher::BatcherConfig,
        record::{Category, NewEvent, Payload, Session},
    };

    /// Replays a scripted list of responses, then accepts everything.
    struct Scripted {
        script: Mutex<Vec<Script>>,
        seen: Mutex<Vec<Uuid>>,
    }

    enum Script {
        Fail,
        Accept(Vec<u64>),
    }

    impl Scripted {
        fn new(mut script: Vec<Script>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, batch: &WireBatch) -> Result<WireAck, DeliveryError> {
            self.seen.lock().unwrap().push(batch.batch_id);
            let step = self.script.lock().unwrap().pop();
            let accepted = match step {
                Some(Script::Fail) => return Err(DeliveryError::Status(503)),
                Some(Script::Accept(ids)) => ids,
                None => batch.records.iter().map(|r| r.id).collect(),
            };
            Ok(WireAck {
                schema_version: SCHEMA_VERSION,
                batch_id: batch.batch_id,
                accepted,
            })
        }
    }

    struct Fixture {
        spool: Arc<Spool>,
        batcher: Arc<Batcher>,
        deliverer: Arc<Deliverer>,
        cancel: CancellationToken,
    }

    fn fixture(transport: Arc<dyn Transport>, max_retries: u32) -> Fixture {
        let config = ClientConfig {
            max_retries,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(1),
            ..ClientConfig::default()
        };
        let spool = Arc::new(Spool::in_memory(Session::new()));
        let batcher = Arc::new(Batcher::new(BatcherConfig::from(&config)));
        let cancel = CancellationToken::new();
        let deliverer = Arc::new(Deliverer::new(
            transport,
            Arc::clone(&spool),
            Arc::clone(&batcher),
            &config,
            cancel.clone(),
        ));
        Fixture {
            spool,
            batcher,
            deliverer,
            cancel,
        }
    }

    fn spooled_batch(spool: &Spool, n: usize) -> Batch {
        let records = (0..n)
            .map(|i| {
                let event =
                    NewEvent::new(Category::Metric, format!("m{i}"), Payload::new()).unwrap();
                spool.append(event).unwrap()
            })
            .collect();
        Batch::new(records).unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.ceiling(0), Duration::from_millis(100));
        assert_eq!(policy.ceiling(3), Duration::from_millis(800));
        assert_eq!(policy.ceiling(4), Duration::from_secs(1));
        assert_eq!(policy.ceiling(40), Duration::from_secs(1));
        for attempt in 0..6 {
            let d = policy.backoff(attempt);
            assert!(d >= policy.ceiling(attempt) / 2);
            assert!(d <= policy.ceiling(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acknowledges_all() {
        let f = fixture(Scripted::new(vec![]), 3);
        let batch = spooled_batch(&f.spool, 3);
        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { acknowledged: 3, .. }));
        assert!(f.spool.pending().is_empty());
        assert!(f.batcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_acceptance_requeues_rest() {
        let f = fixture(Scripted::new(vec![Script::Accept(vec![1, 3, 99])]), 3);
        let batch = spooled_batch(&f.spool, 3);
        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Partial {
                acknowledged: 2,
                requeued: 1,
                ..
            }
        ));
        let pending: Vec<u64> = f.spool.pending().iter().map(|r| r.id).collect();
        assert_eq!(pending, vec![2]);
        assert_eq!(f.batcher.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_reuse_batch_id() {
        let transport = Scripted::new(vec![Script::Fail, Script::Fail]);
        let f = fixture(transport.clone(), 3);
        let batch = spooled_batch(&f.spool, 2);
        let id = batch.id;

        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));
        assert_eq!(*transport.seen.lock().unwrap(), vec![id, id, id]);
        assert_eq!(f.deliverer.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_records() {
        let transport = Scripted::new(vec![Script::Fail, Script::Fail, Script::Fail]);
        let f = fixture(transport, 2);
        let batch = spooled_batch(&f.spool, 2);

        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed {
                attempts: 3,
                requeued: 2,
                ..
            }
        ));
        assert_eq!(f.spool.pending_count(), 2);
        assert_eq!(f.batcher.len(), 2);
        assert_eq!(f.deliverer.stats().batches_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let transport = Scripted::new(vec![Script::Fail]);
        let f = fixture(transport, 5);
        let batch = spooled_batch(&f.spool, 1);

        f.cancel.cancel();
        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(outcome, DeliveryOutcome::Cancelled { requeued: 1, .. }));
        assert_eq!(f.spool.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_tracked_until_taken() {
        let f = fixture(Scripted::new(vec![]), 0);
        let handle = tokio::runtime::Handle::current();
        f.deliverer.dispatch(&handle, spooled_batch(&f.spool, 2));
        f.deliverer.dispatch(&handle, spooled_batch(&f.spool, 1));

        let outcomes = join_tasks(f.deliverer.take_in_flight()).await;
        assert!(matches!(
            outcomes.as_slice(),
            [
                DeliveryOutcome::Delivered { acknowledged: 2, .. },
                DeliveryOutcome::Delivered { acknowledged: 1, .. }
            ]
        ));
        assert!(f.deliverer.take_in_flight().is_empty());
        assert_eq!(f.deliverer.stats().records_acknowledged, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_delivery_waits_for_earlier_tasks() {
        let transport = Scripted::new(vec![Script::Fail]);
        let f = fixture(transport.clone(), 3);
        let handle = tokio::runtime::Handle::current();
        let first = spooled_batch(&f.spool, 1);
        let second = spooled_batch(&f.spool, 1);
        let (first_id, second_id) = (first.id, second.id);

        f.deliverer.dispatch(&handle, first);
        let task = f
            .deliverer
            .deliver_in_order(&handle, f.deliverer.take_in_flight(), vec![second]);
        let outcomes = task.await.unwrap();

        assert_eq!(outcomes.len(), 2);
        // the first batch failed once and was retried before the second went out
        assert_eq!(
            *transport.seen.lock().unwrap(),
            vec![first_id, first_id, second_id]
        );
        assert!(f.spool.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_keeps_delivering() {
        let f = fixture(Scripted::new(vec![Script::Fail]), 3);
        let handle = tokio::runtime::Handle::current();
        let task = f
            .deliverer
            .deliver_in_order(&handle, Vec::new(), vec![spooled_batch(&f.spool, 2)]);
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.spool.pending().is_empty());
        assert_eq!(f.deliverer.stats().batches_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_ack_is_a_failure() {
        struct WrongBatch;

        #[async_trait]
        impl Transport for WrongBatch {
            async fn send(&self, batch: &WireBatch) -> Result<WireAck, DeliveryError> {
                Ok(WireAck {
                    schema_version: SCHEMA_VERSION,
                    batch_id: Uuid::new_v4(),
                    accepted: batch.records.iter().map(|r| r.id).collect(),
                })
            }
        }

        let f = fixture(Arc::new(WrongBatch), 0);
        let batch = spooled_batch(&f.spool, 1);
        let outcome = f.deliverer.deliver(batch).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 1, .. }));
        assert_eq!(f.spool.pending_count(), 1);
    }
}
