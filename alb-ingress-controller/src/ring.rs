//! Bounded single-producer/single-consumer channel which evicts the oldest
//! buffered item instead of blocking the producer.
//!
//! Under event storms (e.g. a full resync of the object store) only the most
//! recent events are kept. Consumers must re-derive state by key instead of
//! diffing individual events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Capacity of the controller's event buffer.
pub const EVENT_BUFFER_CAPACITY: usize = 1024;

struct Ring<T> {
    buffer: Mutex<RingState<T>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

struct RingState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Create a ring channel holding at most `capacity` items (at least one).
pub fn ring_channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let capacity = capacity.max(1);
    let ring = Arc::new(Ring {
        buffer: Mutex::new(RingState {
            items: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        capacity,
    });
    (
        RingSender { ring: ring.clone() },
        RingReceiver { ring },
    )
}

pub struct RingSender<T> {
    ring: Arc<Ring<T>>,
}

impl<T> RingSender<T> {
    /// Buffer `item`, evicting the oldest buffered item if the ring is full.
    ///
    /// Never blocks. Returns `false` if the channel has been closed.
    pub fn send(&self, item: T) -> bool {
        {
            let mut state = self.ring.buffer.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.ring.capacity {
                state.items.pop_front();
                self.ring.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(item);
        }
        self.ring.notify.notify_one();
        true
    }

    /// Close the channel, the receiver still drains what is buffered.
    pub fn close(&self) {
        self.ring.buffer.lock().closed = true;
        self.ring.notify.notify_one();
    }

    /// Number of items evicted so far.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for RingSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct RingReceiver<T> {
    ring: Arc<Ring<T>>,
}

impl<T> RingReceiver<T> {
    /// Wait for the oldest buffered item. Returns `None` once the sender is
    /// closed and the buffer has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut state = self.ring.buffer.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.ring.buffer.lock().items.pop_front()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.ring.buffer.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx) = ring_channel(4);
        for i in 0..3 {
            assert!(tx.send(i));
        }
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn burst_keeps_suffix_and_loses_history() {
        // Intentional data loss: a burst larger than the capacity only
        // retains the newest `capacity` events.
        let (tx, mut rx) = ring_channel(8);
        for i in 0..100u32 {
            tx.send(i);
        }
        assert_eq!(tx.dropped(), 92);
        drop(tx);
        let mut observed = Vec::new();
        while let Some(i) = rx.recv().await {
            observed.push(i);
        }
        assert_eq!(observed, (92..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn latest_event_survives_concurrent_burst() {
        let (tx, mut rx) = ring_channel(16);
        let producer = tokio::spawn(async move {
            for i in 0..10_000u32 {
                tx.send(i);
                if i % 1000 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        let mut observed = Vec::new();
        while let Some(i) = rx.recv().await {
            observed.push(i);
        }
        producer.await.unwrap();
        assert_eq!(observed.last(), Some(&9_999));
        // surviving events keep their arrival order
        assert!(observed.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn recv_waits_for_producer() {
        let (tx, mut rx) = ring_channel(2);
        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send("configuration");
        assert_eq!(consumer.await.unwrap(), Some("configuration"));
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let (tx, mut rx) = ring_channel(2);
        tx.send(1);
        tx.close();
        assert!(!tx.send(2));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn zero_capacity_holds_one_item() {
        let (tx, mut rx) = ring_channel(0);
        tx.send(1);
        tx.send(2);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Some(2));
        assert!(rx.is_empty());
    }
}
