//! Error bus.
//!
//! In-process publish/subscribe for [`ErrorEvent`]s over a tokio broadcast
//! channel. Publishing never blocks. Each subscriber has its own bounded
//! buffer; a subscriber that falls behind loses its oldest events, and the
//! loss is counted on that subscription. Lost events are gone before the
//! filter sees them, so the count includes events the filter would have
//! skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_events::{ErrorEvent, Severity};
use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-subscriber buffer size.
pub const DEFAULT_BUS_CAPACITY: usize = 1_024;

/// Errors from non-blocking receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("error bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,
}

/// Which events a subscription wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub min_severity: Option<Severity>,
    pub source: Option<String>,
}

impl EventFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events at or above `severity`.
    pub fn min_severity(severity: Severity) -> Self {
        Self {
            min_severity: Some(severity),
            source: None,
        }
    }

    /// Restrict to events raised by `source`.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn matches(&self, event: &ErrorEvent) -> bool {
        self.min_severity.is_none_or(|min| event.severity >= min)
            && self.source.as_deref().is_none_or(|s| event.source == s)
    }
}

/// Handle for publishing to and subscribing on the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorBus {
    sender: broadcast::Sender<ErrorEvent>,
    dropped: Arc<AtomicU64>,
}

impl ErrorBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: ErrorEvent) {
        debug!(
            event_id = %event.id,
            severity = %event.severity,
            source = %event.source,
            "Publishing error event"
        );
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
            dropped: 0,
            bus_dropped: Arc::clone(&self.dropped),
        }
    }

    /// Events lost across all subscriptions since the bus was created.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A filtered view of the bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ErrorEvent>,
    filter: EventFilter,
    dropped: u64,
    bus_dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<ErrorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Result<ErrorEvent, BusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::TryRecvError::Empty) => return Err(BusError::Empty),
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Events this subscription lost by falling behind, whether or not
    /// they would have matched its filter.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Turn the subscription into a stream of matching events.
    pub fn into_stream(self) -> impl Stream<Item = ErrorEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        self.bus_dropped.fetch_add(n, Ordering::Relaxed);
        warn!(
            dropped = n,
            total_dropped = self.dropped,
            "Error bus subscriber lagged, oldest events dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn event(severity: Severity, source: &str) -> ErrorEvent {
        ErrorEvent::new(severity, source, "test")
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = ErrorBus::new(16);
        let mut a = bus.subscribe(EventFilter::all());
        let mut b = bus.subscribe(EventFilter::all());

        bus.publish(event(Severity::Info, "asr"));
        assert_eq!(a.recv().await.unwrap().source, "asr");
        assert_eq!(b.recv().await.unwrap().source, "asr");
    }

    #[tokio::test]
    async fn test_filter_by_severity_and_source() {
        let bus = ErrorBus::new(16);
        let mut sub = bus.subscribe(EventFilter::min_severity(Severity::Error).from_source("asr"));

        bus.publish(event(Severity::Critical, "tts"));
        bus.publish(event(Severity::Warning, "asr"));
        bus.publish(event(Severity::Error, "asr"));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.severity, Severity::Error);
        assert_eq!(got.source, "asr");
        assert_eq!(sub.try_recv(), Err(BusError::Empty));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_counts() {
        let bus = ErrorBus::new(4);
        let mut slow = bus.subscribe(EventFilter::all());
        let mut fast = bus.subscribe(EventFilter::all());

        for i in 0..10 {
            bus.publish(event(Severity::Info, &format!("agent-{i}")));
            // The fast subscriber keeps up.
            assert_eq!(fast.recv().await.unwrap().source, format!("agent-{i}"));
        }

        // The slow one only sees the newest four.
        assert_eq!(slow.recv().await.unwrap().source, "agent-6");
        assert_eq!(slow.dropped_count(), 6);
        assert_eq!(fast.dropped_count(), 0);
        assert_eq!(bus.dropped_count(), 6);
    }

    #[tokio::test]
    async fn test_dropped_count_includes_filtered_events() {
        let bus = ErrorBus::new(2);
        let mut errors = bus.subscribe(EventFilter::min_severity(Severity::Error));

        bus.publish(event(Severity::Info, "asr"));
        bus.publish(event(Severity::Info, "asr"));
        bus.publish(event(Severity::Error, "asr"));
        bus.publish(event(Severity::Info, "asr"));

        assert_eq!(errors.recv().await.unwrap().severity, Severity::Error);
        assert_eq!(errors.dropped_count(), 2);
        assert_eq!(errors.try_recv(), Err(BusError::Empty));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = ErrorBus::new(1);
        for _ in 0..100 {
            bus.publish(event(Severity::Critical, "asr"));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream() {
        let bus = ErrorBus::new(16);
        let stream = bus.subscribe(EventFilter::min_severity(Severity::Warning)).into_stream();
        bus.publish(event(Severity::Info, "a"));
        bus.publish(event(Severity::Warning, "b"));
        bus.publish(event(Severity::Critical, "c"));
        drop(bus);

        let sources: Vec<_> = stream.map(|e| e.source).collect().await;
        assert_eq!(sources, vec!["b", "c"]);
    }
}
