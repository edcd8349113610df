use crate::helpers::{queue_name, started_holder, wait_for_stats};
use carrot_hutch::consumers::{
    ClosureDecoder, ClosureHandler, DecodeError, HandlerError, JsonDecoder, ListenerOptions,
    ListenerSettings, MessageListener,
};
use carrot_hutch::lifecycle::ServiceGroup;
use carrot_hutch::publishers::PublishMessage;
use carrot_hutch::transport::memory::MemoryBroker;
use carrot_hutch::transport::{Channel, Connection, Connector, IncomingMessage, Message, QueueOptions};
use carrot_hutch::{ConnectionHolder, PoolSizes};
use parking_lot::Mutex;
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(serde::Deserialize)]
struct Payment {
    id: u32,
}

async fn publish(holder: &ConnectionHolder<MemoryBroker>, queue: &str, message: Message) {
    PublishMessage::new(message, "", queue)
        .via_holder(holder)
        .send()
        .await
        .unwrap();
}

fn settings(queue: &str, options: ListenerOptions) -> ListenerSettings {
    ListenerSettings {
        queue_name: queue.to_owned(),
        prefetch_count: Some(4),
        options,
    }
}

/// A handler counting the messages it handles.
fn counting(
    counter: &Arc<AtomicUsize>,
) -> ClosureHandler<
    impl Fn(Payment) -> futures_util::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static,
> {
    let counter = Arc::clone(counter);
    ClosureHandler(move |_: Payment| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures_util::future::ready(Ok(()))
    })
}

#[tokio::test]
async fn published_messages_are_decoded_handled_and_acked() {
    // Arrange
    let (holder, broker) = started_holder(2, 4);
    let queue = queue_name();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel = holder.acquire_channel().await.unwrap();
    let listener = MessageListener::from_settings(
        &*channel,
        &settings(&queue, ListenerOptions::default()),
        JsonDecoder::<Payment>::new(),
        ClosureHandler({
            let seen = Arc::clone(&seen);
            move |payment: Payment| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(payment.id);
                    Ok::<(), HandlerError>(())
                }
            }
        }),
    )
    .await
    .unwrap();
    listener.start().await.unwrap();

    // Act
    for id in 0..3 {
        publish(&holder, &queue, Message::json(&serde_json::json!({ "id": id })).unwrap()).await;
    }

    // Assert
    let stats = wait_for_stats(&broker, &queue, |s| s.acked == 3).await;
    assert_eq!(stats.requeued + stats.discarded, 0);
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_redelivered() {
    let (holder, broker) = started_holder(1, 4);
    let queue = queue_name();
    let channel = holder.acquire_channel().await.unwrap();
    // Fails on the first delivery, succeeds on the redelivery.
    let listener = MessageListener::from_settings(
        &*channel,
        &settings(&queue, ListenerOptions::default()),
        ClosureDecoder(|message: &IncomingMessage| {
            Ok::<_, DecodeError>(message.redelivered)
        }),
        ClosureHandler(|redelivered: bool| async move {
            if redelivered {
                Ok(())
            } else {
                Err(HandlerError::use_requeue(anyhow::anyhow!("Downstream timed out")))
            }
        }),
    )
    .await
    .unwrap();
    listener.start().await.unwrap();

    publish(&holder, &queue, Message::new("retry me")).await;

    let stats = wait_for_stats(&broker, &queue, |s| s.acked == 1).await;
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.discarded, 0);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_messages_are_discarded_without_reaching_the_handler() {
    let (holder, broker) = started_holder(1, 4);
    let queue = queue_name();
    let calls = Arc::new(AtomicUsize::new(0));
    let channel = holder.acquire_channel().await.unwrap();
    let listener = MessageListener::from_settings(
        &*channel,
        &settings(&queue, ListenerOptions::default()),
        JsonDecoder::<Payment>::new(),
        counting(&calls),
    )
    .await
    .unwrap();
    listener.start().await.unwrap();

    publish(&holder, &queue, Message::new("{ not json")).await;

    let stats = wait_for_stats(&broker, &queue, |s| s.discarded == 1).await;
    assert_eq!(stats.acked, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn listeners_sharing_a_queue_are_stopped_independently() {
    // Arrange
    let (holder, broker) = started_holder(1, 4);
    let queue = queue_name();
    let (first_calls, second_calls) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let first_channel = holder.acquire_channel().await.unwrap();
    let second_channel = holder.acquire_channel().await.unwrap();
    let first = MessageListener::from_settings(
        &*first_channel,
        &settings(&queue, ListenerOptions::default()),
        JsonDecoder::<Payment>::new(),
        counting(&first_calls),
    )
    .await
    .unwrap();
    let second = MessageListener::from_settings(
        &*second_channel,
        &settings(&queue, ListenerOptions::default()),
        JsonDecoder::<Payment>::new(),
        counting(&second_calls),
    )
    .await
    .unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();
    let payment = Message::json(&serde_json::json!({ "id": 1 })).unwrap();

    for _ in 0..10 {
        publish(&holder, &queue, payment.clone()).await;
    }
    wait_for_stats(&broker, &queue, |s| s.acked == 10).await;
    assert!(first_calls.load(Ordering::SeqCst) > 0);
    assert!(second_calls.load(Ordering::SeqCst) > 0);

    // Act
    first.stop().await.unwrap();
    let handled_by_first = first_calls.load(Ordering::SeqCst);
    let handled_by_second = second_calls.load(Ordering::SeqCst);
    for _ in 0..4 {
        publish(&holder, &queue, payment.clone()).await;
    }

    // Assert
    let stats = wait_for_stats(&broker, &queue, |s| s.acked == 14).await;
    assert_eq!(stats.consumers, 1);
    assert_eq!(first_calls.load(Ordering::SeqCst), handled_by_first);
    assert_eq!(second_calls.load(Ordering::SeqCst), handled_by_second + 4);
    assert!(second.is_running());
    second.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_a_pull_listener_gives_its_messages_back_to_the_broker() {
    // Arrange
    let (holder, broker) = started_holder(1, 4);
    let queue = queue_name();
    let channel = holder.acquire_channel().await.unwrap();
    let options = ListenerOptions {
        consume_async: false,
        ..ListenerOptions::default()
    };
    let listener = MessageListener::from_settings(
        &*channel,
        &ListenerSettings {
            prefetch_count: None,
            ..settings(&queue, options)
        },
        JsonDecoder::<Payment>::new(),
        ClosureHandler(|_: Payment| async move {
            std::future::pending::<()>().await;
            Ok::<(), HandlerError>(())
        }),
    )
    .await
    .unwrap();
    listener.start().await.unwrap();
    let payment = Message::json(&serde_json::json!({ "id": 1 })).unwrap();
    publish(&holder, &queue, payment.clone()).await;
    publish(&holder, &queue, payment).await;
    wait_for_stats(&broker, &queue, |s| s.unacked == 2).await;

    // Act
    listener.stop().await.unwrap();

    // Assert
    let stats = wait_for_stats(&broker, &queue, |s| s.ready == 2 && s.unacked == 0).await;
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.acked + stats.discarded, 0);
    assert!(!listener.health_check().await);
}

#[tokio::test]
async fn a_service_group_runs_the_holder_and_its_listeners_until_shutdown() {
    // Arrange
    let broker = MemoryBroker::new();
    let holder = Arc::new(ConnectionHolder::new(broker.clone(), PoolSizes::default()));
    let queue = queue_name();
    let calls = Arc::new(AtomicUsize::new(0));
    let channel = broker
        .connect()
        .await
        .unwrap()
        .create_channel()
        .await
        .unwrap();
    let memory_queue = channel
        .declare_queue(&queue, &QueueOptions::default())
        .await
        .unwrap();
    let listener = Arc::new(
        MessageListener::builder(
            Arc::new(memory_queue),
            JsonDecoder::<Payment>::new(),
            counting(&calls),
        )
        .build(),
    );
    let group = Arc::new(
        ServiceGroup::new()
            .service(Arc::clone(&holder))
            .service(Arc::clone(&listener)),
    );
    let shutdown = Arc::new(ShutdownHandler::new());

    // Act
    let running = tokio::spawn({
        let group = Arc::clone(&group);
        let shutdown = Arc::clone(&shutdown);
        async move { group.run_until_shutdown(shutdown).await }
    });
    while !group.health_check().await {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    publish(&holder, &queue, Message::json(&serde_json::json!({ "id": 9 })).unwrap()).await;
    wait_for_stats(&broker, &queue, |s| s.acked == 1).await;
    shutdown.shutdown();
    running.await.unwrap().unwrap();

    // Assert
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!listener.is_running());
    assert!(!holder.is_started());
    assert_eq!(broker.queue_stats(&queue).unwrap().consumers, 0);
}

#[tokio::test]
async fn a_panicking_handler_does_not_stop_a_pull_listener() {
    // Arrange
    let (holder, broker) = started_holder(1, 4);
    let queue = queue_name();
    let channel = holder.acquire_channel().await.unwrap();
    let listener = MessageListener::from_settings(
        &*channel,
        &settings(
            &queue,
            ListenerOptions {
                consume_async: false,
                ..ListenerOptions::default()
            },
        ),
        ClosureDecoder(|message: &IncomingMessage| {
            Ok::<_, DecodeError>(String::from_utf8_lossy(&message.data).into_owned())
        }),
        ClosureHandler(|payload: String| async move {
            if payload == "poison" {
                panic!("Cannot handle {payload}");
            }
            Ok::<(), HandlerError>(())
        }),
    )
    .await
    .unwrap();
    listener.start().await.unwrap();

    // Act
    publish(&holder, &queue, Message::new("poison")).await;
    publish(&holder, &queue, Message::new("fine")).await;

    // Assert
    let stats = wait_for_stats(&broker, &queue, |s| s.acked == 1 && s.discarded == 1).await;
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.consumers, 1);
    assert!(listener.health_check().await);
    listener.stop().await.unwrap();
    assert_eq!(broker.queue_stats(&queue).unwrap().consumers, 0);
}
