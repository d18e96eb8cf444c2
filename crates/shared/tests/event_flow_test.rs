//! 事件流集成测试
//!
//! 通过内存 broker 走通 发布 -> 拉取 -> 提交 -> 重启 的完整链路。

use std::time::Duration;

use shop_shared::dlq::{DeadLetterMessage, DeadLetterPublisher};
use shop_shared::events::{self, DomainEvent};
use shop_shared::fetch;
use shop_shared::kafka::{EventPublisher, OffsetCommitter};
use shop_shared::test_utils::InMemoryBroker;
use tokio::sync::watch;

const TOPIC: &str = "user_created";
const GROUP: &str = "email-service";

#[tokio::test]
async fn test_published_event_is_fetched_and_decoded() {
    let broker = InMemoryBroker::new(3);
    let event = DomainEvent::user_created("u1", "a@example.com", "alice");

    let delivery = broker.publish(TOPIC, "a@example.com", &event).await.unwrap();
    assert!(broker.has_topic(TOPIC));

    let (_stop, shutdown) = watch::channel(false);
    let (mut messages, _errors) = fetch::stream(broker.consumer(TOPIC, GROUP), 1, shutdown);

    let msg = messages.recv().await.unwrap();
    assert_eq!(msg.partition, delivery.partition);
    assert_eq!(msg.offset, delivery.offset);
    assert_eq!(msg.key_str(), Some("a@example.com"));

    match events::decode(&msg.payload).unwrap() {
        DomainEvent::UserCreated { user } => {
            assert_eq!(user.email(), "a@example.com");
            assert_eq!(user.username(), "alice");
        }
        other => panic!("意外的事件类型: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_publish_is_returned_to_caller() {
    let broker = InMemoryBroker::new(1);
    broker.fail_next_publish("broker unavailable");

    let event = DomainEvent::user_created("u1", "a@example.com", "alice");
    let result = broker.publish(TOPIC, "a@example.com", &event).await;

    assert!(result.is_err());
    assert!(broker.records(TOPIC).is_empty());
}

#[tokio::test]
async fn test_uncommitted_message_is_redelivered_after_restart() {
    let broker = InMemoryBroker::new(1);
    for i in 0..2 {
        let event = DomainEvent::user_created(format!("u{i}"), "a@example.com", "alice");
        broker.publish(TOPIC, "a@example.com", &event).await.unwrap();
    }

    let consumer = broker.consumer(TOPIC, GROUP);
    let (stop, shutdown) = watch::channel(false);
    let (mut messages, errors) = fetch::stream(consumer.clone(), 1, shutdown);

    let first = messages.recv().await.unwrap();
    consumer.commit(&first).await.unwrap();
    // 第二条拉取后未提交就关闭
    let _second = messages.recv().await.unwrap();
    stop.send(true).unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(1), errors)
            .await
            .unwrap()
            .is_err()
    );
    consumer.close();

    let restarted = broker.consumer(TOPIC, GROUP);
    let (_stop, shutdown) = watch::channel(false);
    let (mut messages, _errors) = fetch::stream(restarted, 1, shutdown);
    assert_eq!(messages.recv().await.unwrap().offset, 1);
}

#[tokio::test]
async fn test_dead_letter_keeps_source_position() {
    let broker = InMemoryBroker::new(1);
    broker
        .publish(
            TOPIC,
            "a@example.com",
            &DomainEvent::user_created("u1", "a@example.com", "alice"),
        )
        .await
        .unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let (mut messages, _errors) = fetch::stream(broker.consumer(TOPIC, GROUP), 1, shutdown);
    let msg = messages.recv().await.unwrap();

    let dlq = DeadLetterPublisher::new(broker.clone(), "user_created.dlq", "email-worker");
    dlq.send(&msg, "smtp rejected", 1).await.unwrap();

    let stored = broker.records("user_created.dlq");
    let dead_letter: DeadLetterMessage = serde_json::from_slice(&stored[0].payload).unwrap();
    assert_eq!(dead_letter.source_topic, TOPIC);
    assert_eq!(dead_letter.source_offset, msg.offset);
    assert_eq!(dead_letter.error, "smtp rejected");
}
