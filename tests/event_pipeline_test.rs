// End-to-end coverage of the in-process event path: bus -> handlers ->
// websocket fanout, plus the wire shape shared with the Redis bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use titan_aas::fanout::{EventFilter, SubscriptionManager};
use titan_aas::{
    EventBus, EventEntity, EventHandler, EventKind, MemoryEventBus, RepositoryEvent,
};

struct CountingHandler {
    seen: AtomicUsize,
    fail_first: AtomicUsize,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &RepositoryEvent) -> anyhow::Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("transient failure");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

async fn wait_for(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within deadline");
}

#[tokio::test]
async fn bus_delivers_to_fanout_with_filters() {
    let bus = MemoryEventBus::new();
    let fanout = Arc::new(SubscriptionManager::new());
    bus.subscribe(Arc::clone(&fanout) as Arc<dyn EventHandler>).await;
    bus.start().await.unwrap();

    let submodel_only = fanout.subscribe(EventFilter {
        entity: Some(EventEntity::Submodel),
        event_types: vec![EventKind::Updated],
        entity_id: None,
    });
    let everything = fanout.subscribe(EventFilter::default());

    bus.publish(RepositoryEvent::new(EventKind::Created, EventEntity::Aas, "urn:x:aas:1"))
        .await
        .unwrap();
    bus.publish(
        RepositoryEvent::new(EventKind::Updated, EventEntity::Submodel, "urn:x:sm:1")
            .with_etag("abc"),
    )
    .await
    .unwrap();

    wait_for(|| everything.queued() == 2).await;
    assert_eq!(submodel_only.queued(), 1);

    let only = submodel_only.recv().await;
    assert_eq!(only.identifier, "urn:x:sm:1");
    assert_eq!(only.etag.as_deref(), Some("abc"));

    bus.stop().await;
}

#[tokio::test]
async fn failing_handler_does_not_block_others() {
    let bus = MemoryEventBus::new();
    let flaky = Arc::new(CountingHandler {
        seen: AtomicUsize::new(0),
        fail_first: AtomicUsize::new(2),
    });
    let steady = Arc::new(CountingHandler {
        seen: AtomicUsize::new(0),
        fail_first: AtomicUsize::new(0),
    });
    bus.subscribe(flaky.clone()).await;
    bus.subscribe(steady.clone()).await;
    bus.start().await.unwrap();

    for i in 0..3 {
        bus.publish(RepositoryEvent::new(
            EventKind::Created,
            EventEntity::ConceptDescription,
            format!("urn:x:cd:{i}"),
        ))
        .await
        .unwrap();
    }

    wait_for(|| steady.seen.load(Ordering::SeqCst) == 3).await;
    assert_eq!(flaky.seen.load(Ordering::SeqCst), 3);
    bus.stop().await;
}

#[tokio::test]
async fn slow_consumer_drops_oldest_not_newest() {
    let fanout = SubscriptionManager::with_queue_capacity(3);
    let subscription = fanout.subscribe(EventFilter::default());

    for i in 0..10 {
        fanout.publish(&RepositoryEvent::new(
            EventKind::Updated,
            EventEntity::Element,
            format!("urn:x:sm:{i}"),
        ));
    }

    assert_eq!(subscription.queued(), 3);
    let first = subscription.recv().await;
    assert_eq!(first.identifier, "urn:x:sm:7");
}

#[test]
fn event_envelope_matches_wire_contract() {
    let event = RepositoryEvent::new(EventKind::Updated, EventEntity::Element, "urn:x:sm:1")
        .with_path("Stack[0].Temperature")
        .with_etag("0123456789abcdef")
        .with_value_bytes(b"\"24.1\"".to_vec());

    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["entity"], "element");
    assert_eq!(wire["eventType"], "updated");
    assert_eq!(wire["idShortPath"], "Stack[0].Temperature");
    // Byte payloads are base64 strings inside the JSON envelope.
    assert_eq!(wire["valueBytes"], "IjI0LjEi");

    let back: RepositoryEvent = serde_json::from_value(wire).unwrap();
    assert_eq!(back, event);
}

#[tokio::test]
async fn unsubscribed_connection_receives_nothing_further() {
    let fanout = SubscriptionManager::new();
    let subscription = fanout.subscribe(EventFilter {
        entity: None,
        event_types: Vec::new(),
        entity_id: Some("urn:x:aas:1".to_string()),
    });

    fanout.publish(&RepositoryEvent::new(EventKind::Created, EventEntity::Aas, "urn:x:aas:1"));
    assert_eq!(subscription.queued(), 1);

    assert!(fanout.unsubscribe(subscription.id()));
    fanout.publish(&RepositoryEvent::new(EventKind::Deleted, EventEntity::Aas, "urn:x:aas:1"));
    assert_eq!(subscription.queued(), 1);
    assert_eq!(fanout.subscription_count(), 0);
}
