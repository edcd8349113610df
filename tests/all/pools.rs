use crate::helpers::started_holder;
use carrot_hutch::pool::PoolError;
use carrot_hutch::transport::Channel;
use carrot_hutch::ConnectionHolderError;
use std::time::Duration;

#[tokio::test]
async fn callers_wait_for_a_channel_once_the_pool_is_exhausted() {
    // Arrange
    let (holder, _broker) = started_holder(1, 2);
    let first = holder.acquire_channel().await.unwrap();
    let _second = holder.acquire_channel().await.unwrap();

    // Act
    let exhausted = tokio::time::timeout(Duration::from_millis(50), holder.acquire_channel()).await;
    holder.release_channel(first);
    let third = tokio::time::timeout(Duration::from_millis(50), holder.acquire_channel()).await;

    // Assert
    assert!(exhausted.is_err());
    assert!(!third.unwrap().unwrap().is_closed());
}

#[tokio::test]
async fn stopping_the_holder_waits_for_checked_out_channels() {
    // Arrange
    let (holder, broker) = started_holder(1, 2);
    let channel = holder.acquire_channel().await.unwrap();

    // Act
    let (_, outcome) = tokio::join!(holder.stop(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let still_open = !channel.is_closed();
        holder.release_channel(channel);
        still_open
    });

    // Assert
    assert!(outcome);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn an_unreachable_broker_surfaces_as_a_pool_error() {
    let (holder, broker) = started_holder(1, 1);
    broker.set_unavailable(true);

    let result = holder.acquire_channel().await;

    assert!(matches!(
        result,
        Err(ConnectionHolderError::Pool(PoolError::Backend(_)))
    ));
    assert_eq!(holder.status().unwrap().channels.outstanding, 0);
    assert!(!holder.health_check().await);
}
