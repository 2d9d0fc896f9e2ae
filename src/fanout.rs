// Per-connection event fanout for the WebSocket surface.
//
// The external router owns the sockets; this module owns the subscription
// registry, the per-connection filters and the bounded queues. A full
// queue drops its oldest event so a slow client never blocks publishers.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::events::{EventEntity, EventHandler, EventKind, RepositoryEvent};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What a connection wants to see. Empty `event_types` means every kind.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub entity: Option<EventEntity>,
    pub event_types: Vec<EventKind>,
    pub entity_id: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &RepositoryEvent) -> bool {
        if let Some(entity) = self.entity {
            if event.entity != entity {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(entity_id) = &self.entity_id {
            if &event.identifier != entity_id && &event.identifier_b64 != entity_id {
                return false;
            }
        }
        true
    }
}

struct Queue {
    events: Mutex<VecDeque<RepositoryEvent>>,
    capacity: usize,
    notify: Notify,
}

impl Queue {
    fn push(&self, event: RepositoryEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// One live connection's slice of the event stream.
pub struct Subscription {
    id: Uuid,
    filter: EventFilter,
    queue: Arc<Queue>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Next queued event, waiting if the queue is empty.
    pub async fn recv(&self) -> RepositoryEvent {
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant used by drain loops on shutdown.
    pub fn try_recv(&self) -> Option<RepositoryEvent> {
        self.queue.events.lock().pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.events.lock().len()
    }
}

/// Registry of live subscriptions; also an `EventHandler` so it can be
/// subscribed to either bus implementation directly.
pub struct SubscriptionManager {
    subscriptions: DashMap<Uuid, (EventFilter, Arc<Queue>)>,
    queue_capacity: usize,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            queue_capacity,
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::new()),
            capacity: self.queue_capacity,
            notify: Notify::new(),
        });
        self.subscriptions.insert(id, (filter.clone(), Arc::clone(&queue)));
        debug!(%id, "websocket subscription added");
        Subscription { id, filter, queue }
    }

    /// Remove a closed connection; its remaining queue contents are dropped
    /// with it.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscriptions.remove(&id).is_some();
        if removed {
            debug!(%id, "websocket subscription removed");
        }
        removed
    }

    pub fn publish(&self, event: &RepositoryEvent) {
        for entry in self.subscriptions.iter() {
            let (filter, queue) = entry.value();
            if filter.matches(event) {
                queue.push(event.clone());
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for SubscriptionManager {
    async fn handle(&self, event: &RepositoryEvent) -> anyhow::Result<()> {
        self.publish(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "websocket-fanout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, entity: EventEntity, id: &str) -> RepositoryEvent {
        RepositoryEvent::new(kind, entity, id)
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter {
            entity: Some(EventEntity::Submodel),
            event_types: vec![EventKind::Updated],
            entity_id: Some("urn:x:sm:1".to_string()),
        };
        assert!(filter.matches(&event(EventKind::Updated, EventEntity::Submodel, "urn:x:sm:1")));
        assert!(!filter.matches(&event(EventKind::Created, EventEntity::Submodel, "urn:x:sm:1")));
        assert!(!filter.matches(&event(EventKind::Updated, EventEntity::Aas, "urn:x:sm:1")));
        assert!(!filter.matches(&event(EventKind::Updated, EventEntity::Submodel, "urn:x:sm:2")));
    }

    #[test]
    fn test_filter_accepts_b64_entity_id() {
        let filter = EventFilter {
            entity: None,
            event_types: Vec::new(),
            entity_id: Some(crate::ids::encode_id_to_b64url("urn:x:sm:1")),
        };
        assert!(filter.matches(&event(EventKind::Deleted, EventEntity::Submodel, "urn:x:sm:1")));
    }

    #[tokio::test]
    async fn test_publish_and_recv() {
        let manager = SubscriptionManager::new();
        let sub = manager.subscribe(EventFilter::default());
        manager.publish(&event(EventKind::Created, EventEntity::Aas, "urn:x:aas:1"));
        let received = sub.recv().await;
        assert_eq!(received.identifier, "urn:x:aas:1");
    }

    #[test]
    fn test_oldest_drop_on_full_queue() {
        let manager = SubscriptionManager::with_queue_capacity(2);
        let sub = manager.subscribe(EventFilter::default());
        for i in 0..4 {
            manager.publish(&event(
                EventKind::Created,
                EventEntity::Aas,
                &format!("urn:x:aas:{i}"),
            ));
        }
        assert_eq!(sub.queued(), 2);
        // The two oldest were dropped.
        assert_eq!(sub.try_recv().unwrap().identifier, "urn:x:aas:2");
        assert_eq!(sub.try_recv().unwrap().identifier, "urn:x:aas:3");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let manager = SubscriptionManager::new();
        let sub = manager.subscribe(EventFilter::default());
        assert!(manager.unsubscribe(sub.id()));
        manager.publish(&event(EventKind::Created, EventEntity::Aas, "urn:x:aas:1"));
        assert_eq!(sub.queued(), 0);
        assert!(!manager.unsubscribe(sub.id()));
    }
}
