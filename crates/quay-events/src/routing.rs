//! Event bus routing helpers.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::error::{EventBusError, EventBusResult};
use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Stream wrapper used by subscribers.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<EventEnvelope, BroadcastStreamRecvError>> + Send>>;

/// Shared event bus built on top of `tokio::broadcast`.
///
/// Publishing never blocks: the envelope is pushed into every live receiver
/// before `send` returns, and a bounded replay ring keeps the most recent
/// envelopes for late subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        let replay_capacity = replay_capacity.max(1);
        let (sender, _) = broadcast::channel(replay_capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to the bus, returning a stream of new events.
    ///
    /// When `last_event_id` is supplied, buffered events newer than it are
    /// yielded first. The backlog goes to this subscriber only; other
    /// receivers never see it again.
    #[must_use]
    pub fn subscribe(&self, last_event_id: Option<EventId>) -> EventStream {
        let live = BroadcastStream::new(self.sender.subscribe());
        let Some(last) = last_event_id else {
            return Box::pin(live);
        };
        let backlog = self.backlog_since(last);
        // The receiver was attached before the snapshot, so skip live copies
        // of anything the backlog already holds.
        let resume_after = backlog.last().map_or(last, |env| env.id);
        let live = live.filter(move |item| !matches!(item, Ok(env) if env.id <= resume_after));
        Box::pin(tokio_stream::iter(backlog.into_iter().map(Ok)).chain(live))
    }

    /// Publish a new event to all subscribers.
    pub fn send(&self, event: Event) -> EventId {
        self.dispatch(event).0
    }

    /// Publish and report whether any subscriber was attached.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::NoSubscribers`] when nobody was listening. The
    /// event is still recorded in the replay ring.
    pub fn try_send(&self, event: Event) -> EventBusResult<EventId> {
        let event_kind = event.kind();
        let (event_id, delivered) = self.dispatch(event);
        if delivered {
            Ok(event_id)
        } else {
            Err(EventBusError::NoSubscribers {
                event_id,
                event_kind,
            })
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Last event id observed in the replay buffer.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|env| env.id)
    }

    /// Collect a backlog of events emitted after the specified id.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        let replay = self.lock_replay();
        replay.iter().filter(|env| env.id > id).cloned().collect()
    }

    fn dispatch(&self, event: Event) -> (EventId, bool) {
        let mut next = self
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = *next;
        *next = next.saturating_add(1);
        drop(next);

        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        let delivered = self.sender.send(envelope).is_ok();
        (id, delivered)
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::InfoHash;

    #[tokio::test]
    async fn publish_and_replay_from_id() {
        let bus = EventBus::with_capacity(4);
        let first = bus.send(Event::SettingsChanged {
            description: "init".into(),
        });
        let second = bus.send(Event::PauseStateChanged { paused: true });

        assert_eq!(bus.last_event_id(), Some(second));
        let backlog = bus.backlog_since(first);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second);
    }

    #[test]
    fn replay_ring_drops_oldest_entries() {
        let bus = EventBus::with_capacity(2);
        for _ in 0..3 {
            bus.send(Event::QueueOrdered);
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(
            backlog.iter().map(|env| env.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn try_send_reports_missing_subscribers() {
        let bus = EventBus::new();
        let err = bus
            .try_send(Event::QueueOrdered)
            .expect_err("no subscribers attached");
        assert_eq!(err.event_kind(), "queue_ordered");
        assert_eq!(bus.last_event_id(), Some(err.event_id()));

        let _stream = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.try_send(Event::QueueOrdered).is_ok());
    }

    #[tokio::test]
    async fn resuming_subscriber_does_not_duplicate_for_others() {
        let bus = EventBus::with_capacity(8);
        let mut existing = bus.subscribe(None);
        bus.send(Event::QueueOrdered);
        bus.send(Event::PauseStateChanged { paused: true });

        let mut resumed = bus.subscribe(Some(0));
        bus.send(Event::PauseStateChanged { paused: false });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let envelope = existing
                .next()
                .await
                .expect("stream item")
                .expect("broadcast ok");
            seen.push(envelope.id);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        let mut replayed = Vec::new();
        for _ in 0..3 {
            let envelope = resumed
                .next()
                .await
                .expect("stream item")
                .expect("broadcast ok");
            replayed.push(envelope.id);
        }
        assert_eq!(replayed, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subscribe_streams_events() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe(None);
        let id = bus.send(Event::QueuingNotPossible {
            info_hash: InfoHash::new([7; 20]),
        });
        let envelope = stream
            .next()
            .await
            .expect("stream item")
            .expect("broadcast ok");
        assert_eq!(envelope.id, id);
        assert!(matches!(
            envelope.event,
            Event::QueuingNotPossible { .. }
        ));
    }
}
