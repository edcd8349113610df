use crate::helpers::{queue_name, started_holder};
use carrot_hutch::publishers::{publish_message, PublishMessage, PublishTarget, PublisherError};
use carrot_hutch::transport::{Channel, Message, QueueOptions};
use futures_util::future::join_all;

#[tokio::test]
async fn concurrent_publishers_share_a_bounded_set_of_channels() {
    // Arrange
    let (holder, broker) = started_holder(1, 2);
    let queue = queue_name();
    let channel = holder.acquire_channel().await.unwrap();
    channel
        .declare_queue(&queue, &QueueOptions::default())
        .await
        .unwrap();
    holder.release_channel(channel);

    // Act
    let results = join_all((0..20).map(|i| {
        PublishMessage::new(Message::new(format!("message {i}")), "", &queue)
            .via_holder(&holder)
            .send()
    }))
    .await;

    // Assert
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(broker.queue_stats(&queue).unwrap().ready, 20);
    assert!(broker.open_channels() <= 2);
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(holder.status().unwrap().channels.outstanding, 0);
}

#[tokio::test]
async fn a_channel_closed_by_a_failed_publish_is_replaced() {
    let (holder, broker) = started_holder(1, 1);
    let queue = queue_name();

    // Publishing to a missing exchange makes the broker close the channel.
    let failed = publish_message(
        PublishTarget::Holder(&holder),
        Message::new("lost"),
        "missing-exchange",
        "rk",
        false,
    )
    .await;
    let channel = holder.acquire_channel().await.unwrap();
    channel
        .declare_queue(&queue, &QueueOptions::default())
        .await
        .unwrap();
    holder.release_channel(channel);
    let delivered = publish_message(
        PublishTarget::Holder(&holder),
        Message::new("delivered"),
        "",
        &queue,
        false,
    )
    .await;

    assert!(matches!(failed, Err(PublisherError::Publish(_))));
    assert!(delivered.is_ok());
    assert_eq!(broker.queue_stats(&queue).unwrap().ready, 1);
    assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn publishing_during_a_broker_outage_fails_until_it_recovers() {
    let (holder, broker) = started_holder(1, 1);
    let queue = queue_name();
    broker.set_unavailable(true);

    let during = PublishMessage::new(Message::new("payload"), "", &queue)
        .via_holder(&holder)
        .send()
        .await;
    broker.set_unavailable(false);
    let channel = holder.acquire_channel().await.unwrap();
    channel
        .declare_queue(&queue, &QueueOptions::default())
        .await
        .unwrap();
    holder.release_channel(channel);
    let after = PublishMessage::new(Message::new("payload"), "", &queue)
        .via_holder(&holder)
        .send()
        .await;

    assert!(matches!(during, Err(PublisherError::Channel(_))));
    assert!(after.is_ok());
}

#[tokio::test]
async fn unroutable_messages_are_reported() {
    let (holder, _broker) = started_holder(1, 1);

    let result = PublishMessage::new(Message::new("payload"), "", "nobody-listens-here")
        .via_holder(&holder)
        .send()
        .await;

    assert!(matches!(result, Err(PublisherError::Publish(_))));
}
