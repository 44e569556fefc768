use astro_supervisor::bus::EventBus;
use astro_supervisor::event::{Event, EventKind};

fn numbered(n: i64) -> Event {
    Event::new(EventKind::Message).with("n", n)
}

fn number(event: &Event) -> i64 {
    event.get("n").and_then(|v| v.as_i64()).unwrap()
}

#[tokio::test]
async fn test_delivery_order_matches_publish_order() {
    let bus = EventBus::new(32);
    let mut a = bus.subscribe("a");
    let mut b = bus.subscribe("b");

    for n in 0..10 {
        bus.publish(numbered(n));
    }
    drop(bus);

    for subscription in [&mut a, &mut b] {
        let mut seen = Vec::new();
        while let Some(event) = subscription.recv().await {
            seen.push(number(&event));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(subscription.dropped(), 0);
    }
}

#[tokio::test]
async fn test_full_queue_drops_oldest_for_that_subscriber_only() {
    let bus = EventBus::new(4);
    let mut slow = bus.subscribe("slow");
    let mut fast = bus.subscribe("fast");

    let mut fast_seen = Vec::new();
    for n in 0..10 {
        bus.publish(numbered(n));
        fast_seen.push(number(&fast.recv().await.unwrap()));
    }
    drop(bus);

    let mut slow_seen = Vec::new();
    while let Some(event) = slow.recv().await {
        slow_seen.push(number(&event));
    }

    assert_eq!(fast_seen, (0..10).collect::<Vec<_>>());
    assert_eq!(fast.dropped(), 0);

    // The newest events survive, still in order.
    assert_eq!(slow_seen, vec![6, 7, 8, 9]);
    assert_eq!(slow.dropped(), 6);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_harmless() {
    let bus = EventBus::new(2);
    for n in 0..5 {
        bus.publish(numbered(n));
    }
    assert_eq!(bus.subscriber_count(), 0);

    let mut late = bus.subscribe("late");
    bus.publish(numbered(99));
    assert_eq!(number(&late.recv().await.unwrap()), 99);
}

#[tokio::test]
async fn test_stream_ends_after_last_sender_drops() {
    let bus = EventBus::new(8);
    let clone = bus.clone();
    let mut subscription = bus.subscribe("sub");

    bus.publish(numbered(1));
    drop(bus);
    clone.publish(numbered(2));
    drop(clone);

    assert_eq!(number(&subscription.recv().await.unwrap()), 1);
    assert_eq!(number(&subscription.recv().await.unwrap()), 2);
    assert!(subscription.recv().await.is_none());
}
