//! One-producer-many-consumer broadcast with bounded, drop-oldest
//! per-consumer queues (spec §4.2).
//!
//! Within a single consumer's queue, delivery order is strictly FIFO of
//! whatever survived eviction. Across consumers, ordering is independent.
//! The transport layer prioritizes freshness over lossless fan-out:
//! durability is delegated to the checkpointed sink (spec §4.2 rationale).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 100;

struct ConsumerQueue<T> {
    items: parking_lot_mutex::Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

// A tiny local shim so this crate doesn't need to pull in `parking_lot`
// directly for a single `Mutex`; kept as a module to make the dependency
// boundary explicit if it ever needs to grow.
mod parking_lot_mutex {
    pub use std::sync::Mutex;
}

impl<T> ConsumerQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: parking_lot_mutex::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `item`, applying drop-oldest eviction if the queue is full.
    /// Returns `true` if an existing item had to be dropped to make room.
    fn push(&self, item: T) -> bool {
        let mut guard = self.items.lock().expect("fanout queue mutex poisoned");
        let mut dropped = false;
        if guard.len() >= self.capacity {
            guard.pop_front();
            dropped = true;
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(item);
        drop(guard);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().expect("fanout queue mutex poisoned").pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().expect("fanout queue mutex poisoned").len()
    }
}

/// Handle returned by [`BoundedFanout::register`]; the consumer's read side
/// of its bounded queue.
pub struct QueueHandle<T> {
    queue: Arc<ConsumerQueue<T>>,
}

impl<T> QueueHandle<T> {
    /// Awaits and returns the next item, or `None` once the queue has been
    /// unregistered and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Number of items currently enqueued for this consumer.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items dropped for this consumer by overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// One-producer-many-consumer broadcast. `T` is typically a
/// `stage_core::DomainEvent` or an Arrow `RecordBatch`.
pub struct BoundedFanout<T> {
    consumers: DashMap<String, Arc<ConsumerQueue<T>>>,
    capacity: usize,
}

impl<T: Clone> BoundedFanout<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            consumers: DashMap::new(),
            capacity,
        }
    }

    /// Registers a new consumer, creating its bounded queue.
    pub fn register(&self, consumer_id: impl Into<String>) -> QueueHandle<T> {
        let queue = Arc::new(ConsumerQueue::new(self.capacity));
        self.consumers.insert(consumer_id.into(), queue.clone());
        QueueHandle { queue }
    }

    /// Registers a new consumer and returns an RAII handle that unregisters
    /// it on drop, regardless of how the caller stops polling (a clean
    /// disconnect, an error, or the containing future simply being dropped
    /// mid-await). Prefer this over `register`/`unregister` for any consumer
    /// whose lifetime is tied to a stream a client can disconnect from
    /// (spec §4.5 "on client disconnect, the server cancels its producer
    /// side and releases pending batches").
    pub fn register_guarded(self: &Arc<Self>, consumer_id: impl Into<String>) -> FanoutConsumer<T> {
        let consumer_id = consumer_id.into();
        let handle = self.register(consumer_id.clone());
        FanoutConsumer {
            fanout: self.clone(),
            consumer_id,
            handle,
        }
    }

    /// Closes a consumer's queue; any items still enqueued remain available
    /// to drain via the existing [`QueueHandle`], but no further items will
    /// be delivered to it once drained.
    pub fn unregister(&self, consumer_id: &str) {
        if let Some((_, queue)) = self.consumers.remove(consumer_id) {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_waiters();
        }
    }

    /// Publishes `item` to every registered consumer, applying drop-oldest
    /// eviction per-consumer on overflow. Returns the number of consumers
    /// for which an item had to be dropped to make room.
    pub fn publish(&self, item: T) -> usize {
        let mut drops = 0;
        for entry in self.consumers.iter() {
            let dropped = entry.value().push(item.clone());
            if dropped {
                drops += 1;
                debug!(consumer_id = %entry.key(), "fanout queue full, dropped oldest item");
            }
        }
        drops
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

impl<T: Clone> Default for BoundedFanout<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// RAII guard returned by [`BoundedFanout::register_guarded`]. Unregisters
/// the consumer when dropped, so a leaked or abruptly-cancelled stream
/// never leaves a stale queue behind in the fanout.
pub struct FanoutConsumer<T: Clone> {
    fanout: Arc<BoundedFanout<T>>,
    consumer_id: String,
    handle: QueueHandle<T>,
}

impl<T: Clone> FanoutConsumer<T> {
    pub async fn recv(&self) -> Option<T> {
        self.handle.recv().await
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }
}

impl<T: Clone> Drop for FanoutConsumer<T> {
    fn drop(&mut self) {
        self.fanout.unregister(&self.consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_items_in_fifo_order() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(10);
        let handle = fanout.register("consumer-a");
        fanout.publish(1);
        fanout.publish(2);
        fanout.publish(3);
        assert_eq!(handle.recv().await, Some(1));
        assert_eq!(handle.recv().await, Some(2));
        assert_eq!(handle.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_item() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(2);
        let handle = fanout.register("consumer-a");
        fanout.publish(1);
        fanout.publish(2);
        let drops = fanout.publish(3);
        assert_eq!(drops, 1);
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.recv().await, Some(2));
        assert_eq!(handle.recv().await, Some(3));
        assert_eq!(handle.dropped(), 1);
    }

    #[tokio::test]
    async fn queue_length_never_exceeds_capacity() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(5);
        let handle = fanout.register("consumer-a");
        for i in 0..100 {
            fanout.publish(i);
            assert!(handle.len() <= 5);
        }
    }

    #[tokio::test]
    async fn consumers_are_independent() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(10);
        let a = fanout.register("a");
        let b = fanout.register("b");
        fanout.publish(42);
        assert_eq!(a.recv().await, Some(42));
        assert_eq!(b.recv().await, Some(42));
    }

    #[tokio::test]
    async fn unregister_closes_queue_after_drain() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(10);
        let handle = fanout.register("a");
        fanout.publish(1);
        fanout.unregister("a");
        assert_eq!(handle.recv().await, Some(1));
        assert_eq!(handle.recv().await, None);
    }

    #[tokio::test]
    async fn guarded_consumer_unregisters_on_drop() {
        let fanout = Arc::new(BoundedFanout::<u32>::new(10));
        let consumer = fanout.register_guarded("a");
        assert_eq!(fanout.consumer_count(), 1);
        drop(consumer);
        assert_eq!(fanout.consumer_count(), 0);
    }

    #[tokio::test]
    async fn guarded_consumer_unregisters_even_if_dropped_mid_await() {
        use std::future::Future;
        use std::task::Poll;

        let fanout = Arc::new(BoundedFanout::<u32>::new(10));
        let consumer = fanout.register_guarded("a");
        let mut recv_fut = Box::pin(consumer.recv());
        // Poll once without ever resolving, then drop the future and the
        // guard together, the way a cancelled gRPC stream would.
        std::future::poll_fn(|cx| {
            let _ = recv_fut.as_mut().poll(cx);
            Poll::Ready(())
        })
        .await;
        drop(recv_fut);
        drop(consumer);
        assert_eq!(fanout.consumer_count(), 0);
    }

    #[tokio::test]
    async fn publish_to_other_consumers_proceeds_after_one_drop() {
        let fanout: BoundedFanout<u32> = BoundedFanout::new(1);
        let slow = fanout.register("slow");
        let fast = fanout.register("fast");
        fanout.publish(1);
        fanout.publish(2); // drops 1 from both queues
        assert_eq!(slow.recv().await, Some(2));
        assert_eq!(fast.recv().await, Some(2));
    }
}
