use std::{
    cmp::Ordering,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::ClientConfig,
    queues::BoundedFifo,
    record::{Batch, EventRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
    pub capacity: usize,
}

impl From<&ClientConfig> for BatcherConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_batch_delay: config.max_batch_delay,
            capacity: config.queue_capacity,
        }
    }
}

/// A record waiting to be batched, stamped with when it entered the queue.
struct Queued {
    record: EventRecord,
    enqueued_at: Instant,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record.id.cmp(&other.record.id)
    }
}

/// Groups pending records into batches by size and age.
pub struct Batcher {
    queue: BoundedFifo<Queued>,
    notify: Arc<Notify>,
    config: BatcherConfig,
    /// Set by `requeue`: no scheduled cut before this instant.
    held_until: Mutex<Option<Instant>>,
    handoff: Mutex<()>,
}

impl Batcher {
    pub fn new(config: BatcherConfig) -> Self {
        let notify = Arc::new(Notify::new());
        Self {
            queue: BoundedFifo::new(config.capacity.max(1), Arc::clone(&notify)),
            notify,
            config,
            held_until: Mutex::new(None),
            handoff: Mutex::new(()),
        }
    }

    pub fn config(&self) -> BatcherConfig {
        self.config
    }

    /// Load records recovered from the spool. Capacity is not enforced here.
    pub fn seed(&self, records: Vec<EventRecord>) {
        if records.is_empty() {
            return;
        }
        debug!(records = records.len(), "Seeding batcher from spool");
        self.restore(records);
    }

    /// Enqueue a record. If the queue was full, the oldest records are cut
    /// into a batch that must be dispatched right away.
    pub fn push(&self, record: EventRecord) -> Option<Batch> {
        trace!(id = record.id, "Batcher enqueue");
        let evicted = self.queue.push_evicting(
            Queued {
                record,
                enqueued_at: Instant::now(),
            },
            self.config.max_batch_size,
        );
        if evicted.is_empty() {
            return None;
        }
        debug!(records = evicted.len(), "Batcher at capacity, force-cutting batch");
        Batch::new(evicted.into_iter().map(|q| q.record).collect())
    }

    /// Cut a batch if the size threshold is met or the oldest record has
    /// waited at least `max_batch_delay`. Nothing is cut while a requeue
    /// hold is active.
    pub fn take_ready(&self, now: Instant) -> Option<Batch> {
        if self.held_at(now) {
            return None;
        }
        let max = self.config.max_batch_size;
        let delay = self.config.max_batch_delay;
        let taken = self.queue.pop_front_if(max, |buf| {
            buf.len() >= max || buf.iter().any(|q| q.enqueued_at + delay <= now)
        });
        Batch::new(taken.into_iter().map(|q| q.record).collect())
    }

    /// Cut everything queued into batches of at most `max_batch_size`.
    pub fn drain_all(&self) -> Vec<Batch> {
        let mut batches = Vec::new();
        loop {
            let taken = self.queue.pop_front_n(self.config.max_batch_size);
            match Batch::new(taken.into_iter().map(|q| q.record).collect()) {
                Some(batch) => batches.push(batch),
                None => break,
            }
        }
        batches
    }

    /// Return records to the queue for a later batch. They wait a full
    /// `max_batch_delay` again before becoming due, and scheduled cuts pause
    /// until then.
    pub fn requeue(&self, records: Vec<EventRecord>) {
        if records.is_empty() {
            return;
        }
        let now = Instant::now();
        *self.held_until.lock().expect("Batcher hold poisoned") =
            Some(now + self.config.max_batch_delay);
        self.restore(records);
    }

    fn restore(&self, records: Vec<EventRecord>) {
        let now = Instant::now();
        self.queue.requeue(records.into_iter().map(|record| Queued {
            record,
            enqueued_at: now,
        }));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let due = self
            .queue
            .min_by_key(|q| q.enqueued_at)
            .map(|oldest| oldest + self.config.max_batch_delay)?;
        let held = *self.held_until.lock().expect("Batcher hold poisoned");
        Some(held.map_or(due, |h| due.max(h)))
    }

    fn held_at(&self, now: Instant) -> bool {
        let mut held = self.held_until.lock().expect("Batcher hold poisoned");
        match *held {
            Some(until) if now < until => true,
            Some(_) => {
                *held = None;
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Held while a cut batch is on its way to the deliverer. Anyone who
    /// removes records from the queue takes it first, so a flush never sees
    /// a batch that left the queue but was not yet dispatched.
    pub fn handoff(&self) -> MutexGuard<'_, ()> {
        self.handoff.lock().expect("Batcher handoff poisoned")
    }

    /// Wake the pump so it re-evaluates thresholds.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Background loop: cut ready batches and hand them to `dispatch` until
    /// cancelled. While `gate` is closed nothing is cut.
    pub async fn run<F>(
        self: Arc<Self>,
        mut dispatch: F,
        gate: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) where
        F: FnMut(Batch) + Send,
    {
        debug!(
            max_batch_size = self.config.max_batch_size,
            max_batch_delay_ms = self.config.max_batch_delay.as_millis() as u64,
            "Batcher pump started"
        );

        loop {
            let open = gate.load(AtomicOrdering::Acquire);
            if open {
                let _handoff = self.handoff();
                while let Some(batch) = self.take_ready(Instant::now()) {
                    trace!(batch_id = %batch.id, records = batch.len(), "Batch ready");
                    dispatch(batch);
                }
            }
            let deadline = if open { self.next_deadline() } else { None };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }

        debug!("Batcher pump stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Category, NewEvent, Payload, Session};

    fn records(n: u64) -> Vec<EventRecord> {
        let session = Session::new();
        (1..=n)
            .map(|id| {
                let event =
                    NewEvent::new(Category::Metric, format!("k{id}"), Payload::new()).unwrap();
                EventRecord::new(id, &session, event)
            })
            .collect()
    }

    fn batcher(max_batch_size: usize, capacity: usize) -> Batcher {
        Batcher::new(BatcherConfig {
            max_batch_size,
            max_batch_delay: Duration::from_secs(10),
            capacity,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_cuts_batch() {
        let b = batcher(2, 10);
        let mut rs = records(3).into_iter();
        b.push(rs.next().unwrap());
        assert!(b.take_ready(Instant::now()).is_none());
        b.push(rs.next().unwrap());
        let batch = b.take_ready(Instant::now()).unwrap();
        assert_eq!(batch.ids(), vec![1, 2]);
        b.push(rs.next().unwrap());
        assert_eq!(b.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_threshold_cuts_batch() {
        let b = batcher(50, 100);
        for r in records(3) {
            b.push(r);
        }
        assert!(b.take_ready(Instant::now()).is_none());
        assert_eq!(b.next_deadline(), Some(Instant::now() + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        let batch = b.take_ready(Instant::now()).unwrap();
        assert_eq!(batch.ids(), vec![1, 2, 3]);
        assert!(b.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_force_flushes_oldest() {
        let b = batcher(2, 3);
        let mut cut = Vec::new();
        for r in records(7) {
            if let Some(batch) = b.push(r) {
                cut.push(batch.ids());
            }
        }
        assert_eq!(cut, vec![vec![1, 2], vec![3, 4]]);
        // nothing dropped
        let rest: Vec<u64> = b.drain_all().iter().flat_map(|b| b.ids()).collect();
        assert_eq!(rest, vec![5, 6, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_waits_for_next_cycle() {
        let b = batcher(10, 10);
        let mut rs = records(2);
        let second = rs.pop().unwrap();
        b.push(second);
        tokio::time::advance(Duration::from_secs(6)).await;
        b.requeue(rs);
        assert_eq!(b.len(), 2);

        // record 2 is due but the requeue holds cuts until t=16s
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(b.take_ready(Instant::now()).is_none());
        assert_eq!(b.next_deadline(), Some(Instant::now() + Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        let batch = b.take_ready(Instant::now()).unwrap();
        assert_eq!(batch.ids(), vec![1, 2]);

        b.requeue(batch.records);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(b.take_ready(Instant::now()).is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.take_ready(Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_suppresses_size_cut() {
        let b = batcher(2, 10);
        b.requeue(records(3));
        assert!(b.take_ready(Instant::now()).is_none());
        // drain ignores the hold
        assert_eq!(b.drain_all().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all_splits_by_size() {
        let b = batcher(2, 10);
        for r in records(5) {
            b.push(r);
        }
        let sizes: Vec<usize> = b.drain_all().iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_dispatches_and_stops() {
        let b = Arc::new(batcher(2, 10));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let gate = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(Arc::clone(&b).run(
            move |batch| {
                let _ = tx.send(batch.ids());
            },
            gate,
            cancel.clone(),
        ));

        for r in records(3) {
            b.push(r);
        }
        assert_eq!(rx.recv().await, Some(vec![1, 2]));
        // the leftover record goes out once its delay expires
        assert_eq!(rx.recv().await, Some(vec![3]));

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_gate_holds_records() {
        let b = Arc::new(batcher(1, 10));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let gate = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(Arc::clone(&b).run(
            move |batch| {
                let _ = tx.send(batch.ids());
            },
            Arc::clone(&gate),
            cancel.clone(),
        ));

        for r in records(1) {
            b.push(r);
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        gate.store(true, AtomicOrdering::Release);
        b.wake();
        assert_eq!(rx.recv().await, Some(vec![1]));

        cancel.cancel();
        pump.await.unwrap();
    }
}
