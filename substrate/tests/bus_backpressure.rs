//! Publish floods a small subscriber buffer; delivery must stay non-blocking
//! and every drop must be accounted for in the per-topic counters.


use std::collections::HashMap;

use substrate::{MessageBus, SubscriptionFilter};

#[tokio::test]
async fn flood_with_buffer_two_delivers_two_and_drops_eight() {
    let bus = MessageBus::new();
    let sub = bus
        .subscribe("reader", "flood", SubscriptionFilter::default(), 2)
        .await
        .unwrap();

    for i in 0..10 {
        bus.publish("flood", "agent1", format!("{i}").into_bytes(), HashMap::new())
            .await
            .unwrap();
    }

    let stats = bus.topic_stats("flood").await;
    assert_eq!(stats.published_count, 10);
    assert_eq!(stats.delivered_count, 2);
    assert_eq!(stats.dropped_count, 8);
    drop(sub);
}
