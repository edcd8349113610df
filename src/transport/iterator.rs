use futures_util::future::BoxFuture;
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{IncomingMessage, Queue};

/// The callback registered with [`Queue::consume`], invoked once per delivery.
pub type DeliveryCallback =
    Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

/// Identifies a single consumer registration on a queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// A fresh, random consumer tag.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages delivered to a queue, pulled one at a time.
///
/// Obtained via [`Queue::iter`]. Call [`QueueIterator::close`] when done: it cancels the
/// underlying consumer and gives any buffered message back to the broker.
pub struct QueueIterator {
    receiver: mpsc::UnboundedReceiver<IncomingMessage>,
    consumer_tag: ConsumerTag,
}

impl QueueIterator {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<IncomingMessage>,
        consumer_tag: ConsumerTag,
    ) -> Self {
        Self {
            receiver,
            consumer_tag,
        }
    }

    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the consumer has been cancelled and the buffer is empty.
    pub async fn next_message(&mut self) -> Option<IncomingMessage> {
        self.receiver.recv().await
    }

    /// Cancel the consumer and reject, with requeue, every message still sitting in the buffer.
    #[tracing::instrument(name = "queue_iterator_close", skip_all, fields(queue_name = queue.name(), consumer_tag = %self.consumer_tag))]
    pub async fn close<Q: Queue + ?Sized>(mut self, queue: &Q) -> Result<(), anyhow::Error> {
        let cancelled = queue.cancel(&self.consumer_tag).await;
        self.receiver.close();
        let mut requeued = 0usize;
        while let Ok(message) = self.receiver.try_recv() {
            if let Err(e) = message.reject(true).await {
                tracing::warn!(error = %e, delivery_tag = message.delivery_tag, "Failed to requeue a buffered delivery");
            } else {
                requeued += 1;
            }
        }
        if requeued > 0 {
            tracing::debug!(requeued, "Requeued buffered deliveries");
        }
        cancelled
    }
}

impl Stream for QueueIterator {
    type Item = IncomingMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl fmt::Debug for QueueIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueIterator")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}
