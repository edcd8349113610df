use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::scope::ProcessScope;
use super::{
    classify, Disposition, ErrorType, ListenerOptions, ListenerSettings, MessageDecoder,
    MessageHandler, Outcome,
};
use crate::lifecycle::Service;
use crate::transport::{
    Channel, ConsumerTag, DeliveryCallback, IncomingMessage, Queue, QueueIterator, QueueOptions,
};

/// Consumes a queue, decodes every delivery and hands it to a [`MessageHandler`].
///
/// Every delivery gets exactly one disposition, decided by [`classify`]:
/// - successfully handled messages are acked;
/// - messages that fail to decode are rejected, requeued if `requeue_on_invalid_message` is set;
/// - handler failures are rejected according to their [`ErrorType`].
///
/// Deliveries abandoned mid-processing are requeued, deliveries whose handler panicked are
/// discarded.
///
/// # Consumption modes
///
/// In push mode (`consume_async`, the default) the transport invokes the listener for each
/// delivery and messages are processed concurrently, up to the channel's prefetch count.
/// In pull mode a background task processes messages one at a time, in delivery order.
///
/// `start` must not be called on a running listener.
/// Call `stop` before dropping a push-mode listener: its consumer is registered with the
/// transport, which keeps delivering messages to it until it is cancelled.
pub struct MessageListener<T, Q: Queue> {
    queue: Arc<Q>,
    processor: Arc<Processor<T>>,
    consumption: Mutex<Option<Consumption>>,
    running: AtomicBool,
}

enum Consumption {
    Push(ConsumerTag),
    Pull {
        cancellation: CancellationToken,
        task: JoinHandle<()>,
    },
}

struct Processor<T> {
    queue_name: String,
    decoder: Box<dyn MessageDecoder<T>>,
    handler: Box<dyn MessageHandler<T>>,
    options: ListenerOptions,
}

pub struct MessageListenerBuilder<T, Q: Queue> {
    queue: Arc<Q>,
    decoder: Box<dyn MessageDecoder<T>>,
    handler: Box<dyn MessageHandler<T>>,
    options: ListenerOptions,
}

impl<T, Q> MessageListenerBuilder<T, Q>
where
    T: Send + 'static,
    Q: Queue,
{
    /// Requeue messages whose handler failed with an unclassified error.
    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.options.requeue_on_error = requeue;
        self
    }

    /// Requeue messages that could not be decoded.
    pub fn requeue_on_invalid_message(mut self, requeue: bool) -> Self {
        self.options.requeue_on_invalid_message = requeue;
        self
    }

    /// Push mode (`true`) or pull mode (`false`).
    pub fn consume_async(mut self, consume_async: bool) -> Self {
        self.options.consume_async = consume_async;
        self
    }

    pub fn options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> MessageListener<T, Q> {
        MessageListener {
            processor: Arc::new(Processor {
                queue_name: self.queue.name().to_owned(),
                decoder: self.decoder,
                handler: self.handler,
                options: self.options,
            }),
            queue: self.queue,
            consumption: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }
}

impl<T, Q> MessageListener<T, Q>
where
    T: Send + 'static,
    Q: Queue,
{
    pub fn builder<D, H>(queue: Arc<Q>, decoder: D, handler: H) -> MessageListenerBuilder<T, Q>
    where
        D: MessageDecoder<T>,
        H: MessageHandler<T>,
    {
        MessageListenerBuilder {
            queue,
            decoder: Box::new(decoder),
            handler: Box::new(handler),
            options: ListenerOptions::default(),
        }
    }

    /// Declare the queue named in `settings` on `channel`, apply its prefetch count and build a
    /// listener for it.
    ///
    /// The prefetch count applies to the whole channel: give each listener its own channel if
    /// they need different limits.
    pub async fn from_settings<Ch, D, H>(
        channel: &Ch,
        settings: &ListenerSettings,
        decoder: D,
        handler: H,
    ) -> Result<Self, anyhow::Error>
    where
        Ch: Channel<Queue = Q>,
        D: MessageDecoder<T>,
        H: MessageHandler<T>,
    {
        if let Some(prefetch_count) = settings.prefetch_count {
            channel.set_prefetch_count(prefetch_count).await?;
        }
        let queue = channel
            .declare_queue(&settings.queue_name, &QueueOptions::default())
            .await?;
        Ok(Self::builder(Arc::new(queue), decoder, handler)
            .options(settings.options)
            .build())
    }

    pub fn queue_name(&self) -> &str {
        &self.processor.queue_name
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.processor.options
    }

    /// Start consuming.
    ///
    /// In pull mode the consumer is registered before returning: a failure to do so is
    /// returned here rather than surfacing in the background task.
    #[tracing::instrument(
        name = "listener_start",
        skip(self),
        fields(queue_name = %self.processor.queue_name, consume_async = self.processor.options.consume_async)
    )]
    pub async fn start(&self) -> Result<(), anyhow::Error> {
        let mut consumption = self.consumption.lock().await;
        let started = if self.processor.options.consume_async {
            let consumer_tag = self
                .queue
                .consume(push_callback(Arc::clone(&self.processor)))
                .await?;
            tracing::debug!(%consumer_tag, "Consumer registered");
            Consumption::Push(consumer_tag)
        } else {
            let iterator = self.queue.iter().await?;
            tracing::debug!(consumer_tag = %iterator.consumer_tag(), "Consumer registered");
            let cancellation = CancellationToken::new();
            let task = tokio::spawn(pull(
                Arc::clone(&self.queue),
                iterator,
                Arc::clone(&self.processor),
                cancellation.clone(),
            ));
            Consumption::Pull { cancellation, task }
        };
        *consumption = Some(started);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop consuming.
    ///
    /// Push mode cancels this listener's consumer only: deliveries already handed over keep
    /// being processed.
    /// Pull mode cancels the background task and waits for it: the message being handled, if
    /// any, and every buffered message are requeued.
    ///
    /// Stopping a listener that is not running is a no-op.
    #[tracing::instrument(name = "listener_stop", skip(self), fields(queue_name = %self.processor.queue_name))]
    pub async fn stop(&self) -> Result<(), anyhow::Error> {
        let Some(consumption) = self.consumption.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        let result = match consumption {
            Consumption::Push(consumer_tag) => self.queue.cancel(&consumer_tag).await,
            Consumption::Pull { cancellation, task } => {
                cancellation.cancel();
                match task.await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Message processing task panicked");
                        Ok(())
                    }
                }
            }
        };
        tracing::debug!("Message processing stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Healthy while consuming: in pull mode, the background task must still be alive.
    pub async fn health_check(&self) -> bool {
        match &*self.consumption.lock().await {
            Some(Consumption::Push(_)) => true,
            Some(Consumption::Pull { task, .. }) => !task.is_finished(),
            None => false,
        }
    }
}

impl<T, Q: Queue> Drop for MessageListener<T, Q> {
    fn drop(&mut self) {
        // The pull task owns the consumer: let it wind down and requeue what it holds.
        match self.consumption.get_mut() {
            Some(Consumption::Pull { cancellation, .. }) => cancellation.cancel(),
            Some(Consumption::Push(consumer_tag)) => {
                tracing::warn!(
                    %consumer_tag,
                    queue_name = %self.processor.queue_name,
                    "Listener dropped without being stopped, its consumer is still registered"
                );
            }
            None => {}
        }
    }
}

#[async_trait::async_trait]
impl<T, Q> Service for MessageListener<T, Q>
where
    T: Send + 'static,
    Q: Queue,
{
    fn name(&self) -> &str {
        &self.processor.queue_name
    }

    async fn start(&self) -> Result<(), anyhow::Error> {
        MessageListener::start(self).await
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        MessageListener::stop(self).await
    }

    async fn health_check(&self) -> bool {
        MessageListener::health_check(self).await
    }
}

fn push_callback<T: Send + 'static>(processor: Arc<Processor<T>>) -> DeliveryCallback {
    Arc::new(move |message: IncomingMessage| -> BoxFuture<'static, ()> {
        let processor = Arc::clone(&processor);
        Box::pin(async move {
            let _scope = ProcessScope::new(&message);
            processor.process(message, None).await;
        })
    })
}

async fn pull<T, Q>(
    queue: Arc<Q>,
    mut iterator: QueueIterator,
    processor: Arc<Processor<T>>,
    cancellation: CancellationToken,
) where
    T: Send + 'static,
    Q: Queue,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            message = iterator.next_message() => match message {
                Some(message) => message,
                None => break,
            },
        };
        // Each message runs in its own task: a panicking handler must not take the loop down.
        let processing = tokio::spawn({
            let processor = Arc::clone(&processor);
            let cancellation = cancellation.clone();
            async move {
                let _scope = ProcessScope::new(&message);
                processor.process(message, Some(&cancellation)).await;
            }
        });
        if let Err(e) = processing.await {
            tracing::error!(error = %e, queue_name = %processor.queue_name, "Message processing task panicked");
        }
    }
    if let Err(e) = iterator.close(queue.as_ref()).await {
        tracing::warn!(error = ?e, queue_name = %processor.queue_name, "Failed to close the queue iterator");
    }
}

impl<T: Send + 'static> Processor<T> {
    #[tracing::instrument(
        name = "process_message",
        level = "debug",
        skip_all,
        fields(
            queue_name = %self.queue_name,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
        )
    )]
    async fn process(&self, message: IncomingMessage, cancellation: Option<&CancellationToken>) {
        let outcome = match self.decoder.decode(&message).await {
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode an incoming message");
                Outcome::InvalidMessage
            }
            Ok(decoded) => {
                let handled = match cancellation {
                    Some(cancellation) => tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => None,
                        result = self.handler.handle(decoded) => Some(result),
                    },
                    None => Some(self.handler.handle(decoded).await),
                };
                match handled {
                    None => {
                        tracing::debug!("Listener stopped while handling a message");
                        Outcome::Cancelled
                    }
                    Some(Ok(())) => Outcome::Handled,
                    Some(Err(e)) => {
                        match e.error_type {
                            ErrorType::Unclassified => {
                                tracing::error!(error = ?e.inner_error, "Failed to handle an incoming message")
                            }
                            ErrorType::UseRequeue => {
                                tracing::debug!(error = ?e.inner_error, "Transient failure handling an incoming message")
                            }
                            ErrorType::AvoidRequeue => {
                                tracing::warn!(error = ?e.inner_error, "Permanent failure handling an incoming message")
                            }
                        }
                        Outcome::Failed(e.error_type)
                    }
                }
            }
        };

        let disposition = classify(outcome, &self.options);
        let settled = match disposition {
            Disposition::Ack => message.ack().await,
            Disposition::Reject { requeue } => {
                if requeue {
                    tracing::debug!("Requeueing message");
                }
                message.reject(requeue).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(error = %e, ?disposition, "Failed to settle an incoming message");
        }
    }
}
