//! Observable channel primitives used by every subsystem.
//!
//! Two kinds, per the state layer contract:
//!
//! - [`LatestValue`]: holds at most one value; new subscribers receive the
//!   current value immediately (if any), then subsequent updates. `publish`
//!   overwrites.
//! - [`EventChannel`]: broadcast; new subscribers receive only events
//!   published after subscription. Slow subscribers lose the oldest buffered
//!   events rather than blocking the publisher; losses are counted.
//!
//! Both are safe for concurrent publish and subscribe and terminate all
//! subscriber streams on `close()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Default per-subscriber event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// A latest-value channel: a seeded broadcast of the most recent value.
#[derive(Debug)]
pub struct LatestValue<T> {
    tx: Mutex<Option<watch::Sender<Option<T>>>>,
}

impl<T: Clone> LatestValue<T> {
    /// Create an empty channel; subscribers see nothing until the first publish.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Mutex::new(Some(tx)) }
    }

    /// Create a channel pre-seeded with `value`.
    pub fn seeded(value: T) -> Self {
        let (tx, _rx) = watch::channel(Some(value));
        Self { tx: Mutex::new(Some(tx)) }
    }

    /// Overwrite the current value. No-op after `close()`.
    pub fn publish(&self, value: T) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            tx.send_replace(Some(value));
        }
    }

    /// Clear the current value; subscribers are not woken for a clear.
    pub fn clear(&self) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            tx.send_if_modified(|slot| {
                *slot = None;
                false
            });
        }
    }

    /// The current value, if any.
    pub fn get(&self) -> Option<T> {
        self.tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|tx| tx.borrow().clone())
    }

    /// Subscribe; the stream yields the current value first when one exists.
    pub fn subscribe(&self) -> LatestStream<T> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let rx = match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already closed: hand out a receiver whose sender is gone.
                let (tx, rx) = watch::channel(None);
                drop(tx);
                rx
            }
        };
        LatestStream { rx, primed: false }
    }

    /// Number of live subscriber streams.
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Terminate all subscribers. Further publishes are dropped.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

impl<T: Clone> Default for LatestValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of a [`LatestValue`].
#[derive(Debug)]
pub struct LatestStream<T> {
    rx: watch::Receiver<Option<T>>,
    primed: bool,
}

impl<T: Clone> LatestStream<T> {
    /// Next value: the current one on first call (if any), then each update.
    /// Returns `None` once the channel is closed and the last value was seen.
    pub async fn next(&mut self) -> Option<T> {
        if !self.primed {
            self.primed = true;
            let current = self.rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            let value = self.rx.borrow_and_update().clone();
            if value.is_some() {
                return value;
            }
        }
    }

    /// Peek at the current value without consuming an update.
    pub fn current(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

/// A fan-out event channel with drop-oldest backpressure.
#[derive(Debug)]
pub struct EventChannel<T> {
    tx: Mutex<Option<broadcast::Sender<T>>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl<T: Clone> EventChannel<T> {
    /// Channel with the default per-subscriber buffer of 64 events.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_BUFFER)
    }

    /// Channel with an explicit per-subscriber buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Broadcast an event. Never blocks; without subscribers the event is
    /// discarded, and a saturated subscriber loses its oldest buffered event.
    pub fn publish(&self, event: T) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventStream<T> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let rx = match guard.as_ref() {
            Some(tx) => Some(tx.subscribe()),
            None => None,
        };
        EventStream { rx, dropped: Arc::clone(&self.dropped) }
    }

    /// Per-subscriber buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events lost to slow subscribers across all streams.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Terminate all subscriber streams. Further publishes are dropped.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of an [`EventChannel`].
#[derive(Debug)]
pub struct EventStream<T> {
    rx: Option<broadcast::Receiver<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T: Clone> EventStream<T> {
    /// Wait for the next event. `None` once the channel is closed. Events
    /// lost to backpressure are counted and skipped, never surfaced.
    pub async fn next(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::debug!(lost = n, "event subscriber lagged, dropping oldest");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Drain one event without waiting, if one is buffered.
    pub fn try_next(&mut self) -> Option<T> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn latest_value_seeds_new_subscribers() {
        let channel = LatestValue::new();
        channel.publish(7u32);

        let mut stream = channel.subscribe();
        assert_eq!(stream.next().await, Some(7));

        channel.publish(8);
        assert_eq!(stream.next().await, Some(8));
    }

    #[tokio::test]
    async fn latest_value_empty_until_first_publish() {
        let channel: LatestValue<u32> = LatestValue::new();
        assert_eq!(channel.get(), None);

        let mut stream = channel.subscribe();
        let pending = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(pending.is_err(), "nothing to yield before the first publish");

        channel.publish(1);
        assert_eq!(stream.next().await, Some(1));
    }

    #[tokio::test]
    async fn latest_value_overwrites() {
        let channel = LatestValue::new();
        channel.publish(1u32);
        channel.publish(2);
        channel.publish(3);
        assert_eq!(channel.get(), Some(3));

        // A late subscriber only ever sees the latest.
        let mut stream = channel.subscribe();
        assert_eq!(stream.next().await, Some(3));
    }

    #[tokio::test]
    async fn latest_value_close_terminates_subscribers() {
        let channel = LatestValue::new();
        channel.publish(1u32);
        let mut stream = channel.subscribe();
        assert_eq!(stream.next().await, Some(1));

        channel.close();
        assert_eq!(stream.next().await, None);

        // Subscribing after close yields an already-terminated stream.
        let mut late = channel.subscribe();
        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn event_channel_delivers_only_post_subscription_events() {
        let channel = EventChannel::new();
        channel.publish("before");

        let mut stream = channel.subscribe();
        channel.publish("after");
        assert_eq!(stream.next().await, Some("after"));
    }

    #[tokio::test]
    async fn event_channel_fans_out_to_all_subscribers() {
        let channel = EventChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(42u32);
        assert_eq!(a.next().await, Some(42));
        assert_eq!(b.next().await, Some(42));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let channel = EventChannel::with_capacity(4);
        let mut stream = channel.subscribe();

        for i in 0..10u32 {
            channel.publish(i);
        }

        // Oldest events were displaced; the newest four remain.
        let mut seen = Vec::new();
        while let Some(v) = stream.try_next() {
            seen.push(v);
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
        assert_eq!(channel.dropped(), 6);
    }

    #[tokio::test]
    async fn publisher_never_blocks_on_saturated_subscriber() {
        let channel = EventChannel::with_capacity(2);
        let _stream = channel.subscribe();

        let publish_all = async {
            for i in 0..1000u32 {
                channel.publish(i);
            }
        };
        tokio::time::timeout(Duration::from_secs(1), publish_all)
            .await
            .expect("publishing must not block");
    }

    #[tokio::test]
    async fn event_channel_close_terminates_subscribers() {
        let channel: EventChannel<u32> = EventChannel::new();
        let mut stream = channel.subscribe();
        channel.close();
        assert_eq!(stream.next().await, None);
        assert!(channel.subscribe().try_next().is_none());
    }
}
