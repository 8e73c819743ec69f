//! Rent/return buffer pool (spec §6 "List pool"), used by report generation
//! and cleanup passes to snapshot entries without allocating on every tick.

use std::sync::Mutex;

/// A small bounded pool of reusable `Vec<T>` buffers.
///
/// This is deliberately simple: a `Mutex<Vec<Vec<T>>>` free-list. Cleanup
/// jobs run at most once every few seconds and reports are operator-facing,
/// so contention on the pool's own mutex is not a concern — the value is
/// avoiding repeated heap churn for the (possibly large) snapshot buffers
/// themselves, not lock-free access to the pool.
pub struct ListPool<T> {
    free: Mutex<Vec<Vec<T>>>,
    max_pooled: usize,
}

impl<T> ListPool<T> {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Rent a buffer with at least `min_capacity` free capacity.
    pub fn rent(&self, min_capacity: usize) -> Vec<T> {
        let mut free = self.free.lock().expect("list pool mutex poisoned");
        match free.pop() {
            Some(mut buf) => {
                if buf.capacity() < min_capacity {
                    buf.reserve(min_capacity - buf.capacity());
                }
                buf
            }
            None => Vec::with_capacity(min_capacity),
        }
    }

    /// Return a buffer to the pool. `clear_items` truncates it to empty
    /// first; pass `false` only when the caller already drained it.
    pub fn give_back(&self, mut buf: Vec<T>, clear_items: bool) {
        if clear_items {
            buf.clear();
        }
        let mut free = self.free.lock().expect("list pool mutex poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl<T> Default for ListPool<T> {
    fn default() -> Self {
        Self::new(8)
    }
}
