use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

/// Bounded FIFO that never discards. When a push finds the queue full, the
/// oldest `evict` items are handed back to the caller instead of being dropped.
pub struct BoundedFifo<T> {
    inner: Arc<BoundedFifoInner<T>>,
}

struct BoundedFifoInner<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
    notify_any: Arc<Notify>,
}

impl<T> Clone for BoundedFifo<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BoundedFifo<T> {
    pub fn new(capacity: usize, notify_any: Arc<Notify>) -> Self {
        assert!(capacity > 0);

        Self {
            inner: Arc::new(BoundedFifoInner {
                buf: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify_any,
            }),
        }
    }

    /// Push to the back. Returns the evicted oldest items if the queue was
    /// already at capacity.
    pub fn push_evicting(&self, value: T, evict: usize) -> Vec<T> {
        let mut buf = self.inner.buf.lock().expect("BoundedFifo poisoned");
        let evicted = if buf.len() >= self.inner.capacity {
            let n = evict.max(1).min(buf.len());
            buf.drain(..n).collect()
        } else {
            Vec::new()
        };
        buf.push_back(value);
        drop(buf);
        self.inner.notify_any.notify_one();
        evicted
    }

    pub fn pop_front_n(&self, n: usize) -> Vec<T> {
        let mut buf = self.inner.buf.lock().expect("BoundedFifo poisoned");
        let n = n.min(buf.len());
        buf.drain(..n).collect()
    }

    /// Pop up to `n` items, but only if `ready` approves the current contents.
    pub fn pop_front_if<F>(&self, n: usize, ready: F) -> Vec<T>
    where
        F: FnOnce(&VecDeque<T>) -> bool,
    {
        let mut buf = self.inner.buf.lock().expect("BoundedFifo poisoned");
        if buf.is_empty() || !ready(&buf) {
            return Vec::new();
        }
        let n = n.min(buf.len());
        buf.drain(..n).collect()
    }

    pub fn min_by_key<K, F>(&self, key: F) -> Option<K>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let buf = self.inner.buf.lock().expect("BoundedFifo poisoned");
        buf.iter().map(key).min()
    }

    pub fn len(&self) -> usize {
        self.inner.buf.lock().expect("BoundedFifo poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Ord> BoundedFifo<T> {
    /// Put items back regardless of capacity and restore ordering.
    pub fn requeue<I>(&self, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut buf = self.inner.buf.lock().expect("BoundedFifo poisoned");
        let before = buf.len();
        buf.extend(values);
        if buf.len() == before {
            return;
        }
        buf.make_contiguous().sort();
        drop(buf);
        self.inner.notify_any.notify_one();
    }
}
