//! The seam between `carrot-hutch` and the AMQP client doing the actual talking to the broker.
//!
//! The pools, the publisher and the listeners never touch `lapin` directly: they work against
//! the traits defined here - [`Connector`] -> [`Connection`] -> [`Channel`] -> [`Exchange`] /
//! [`Queue`].
//! Two implementations ship with the crate:
//! - [`ConnectionFactory`](crate::amqp::ConnectionFactory), backed by `lapin`, for real brokers;
//! - [`MemoryBroker`](memory::MemoryBroker), an in-process broker for tests and local development.
//!
//! Errors crossing this seam are [`anyhow::Error`]s: the reliability layer propagates them
//! as they are and never inspects them.
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use tokio::sync::mpsc;

mod iterator;
mod message;
pub mod memory;

pub use iterator::{ConsumerTag, DeliveryCallback, QueueIterator};
pub use message::{Acker, DispositionError, IncomingMessage, Message};
pub(crate) use message::SettlementHandle;

#[derive(Clone, PartialEq, Eq, Debug)]
/// Configuration options when declaring a new queue.
pub struct QueueOptions {
    /// Will the queue survive a broker restart?
    pub durability: Durability,
    pub access: Access,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Durable,
            access: Access::Shared,
        }
    }
}

/// Will the queue survive a broker restart?
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Durability {
    /// The queue survives a broker restart.
    ///
    /// Durable queues will be recovered on node boot, including messages in them published as
    /// persistent.
    Durable,
    /// Transient queues are deleted on node boot, together with the messages they hold.
    Transient,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    /// The queue is used by only one connection and it will be deleted when that connection closes.
    Exclusive,
    /// The queue can be used by multiple connections concurrently.
    Shared,
}

/// Opens new connections to a broker.
///
/// This is the creation function of the connection pool: implementers should not pool or cache
/// connections themselves.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a brand new connection.
    ///
    /// Implementations are expected to honour their configured connection timeout.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A connection to a broker. Channels are multiplexed on top of it.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// `true` once the connection has been closed, either by us or by the broker.
    fn is_closed(&self) -> bool;

    /// Close the connection. Closing an already closed connection is a no-op.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A lightweight session multiplexed over a [`Connection`].
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    type Exchange: Exchange;
    type Queue: Queue;

    /// Resolve an exchange handle by name.
    ///
    /// With `ensure` set to `false` no declaration is issued: publishing to an exchange that does
    /// not exist fails.
    /// With `ensure` set to `true` the exchange is declared if absent. Every declared name is
    /// remembered by the channel - dynamic exchange names make that set grow without bound.
    async fn get_exchange(&self, name: &str, ensure: bool)
        -> Result<Self::Exchange, anyhow::Error>;

    /// Declare a queue (idempotent if it already exists with the same settings) and return
    /// a handle to it.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Self::Queue, anyhow::Error>;

    /// Bind a queue to an exchange with a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Limit the number of unacknowledged deliveries pushed to each consumer on this channel.
    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// `true` once the channel has been closed, either by us or by the broker.
    fn is_closed(&self) -> bool;

    /// Close the channel. Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A named routing entity messages are published to.
#[async_trait::async_trait]
pub trait Exchange: Send + Sync {
    /// The name of the exchange. The empty string is the default exchange.
    fn name(&self) -> &str;

    async fn publish(&self, message: Message, routing_key: &str) -> Result<(), anyhow::Error>;
}

/// A handle to a queue messages can be consumed from.
#[async_trait::async_trait]
pub trait Queue: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Register `callback` as a consumer of this queue.
    ///
    /// The transport invokes the callback once per delivery and drives the returned future to
    /// completion.
    async fn consume(&self, callback: DeliveryCallback) -> Result<ConsumerTag, anyhow::Error>;

    /// Cancel the consumer registered under `consumer_tag`.
    ///
    /// Other consumers of the same queue (or channel) are left untouched.
    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<(), anyhow::Error>;

    /// Start iterating over the messages delivered to this queue.
    ///
    /// Deliveries are buffered in an unbounded channel. The insertion into the buffer happens
    /// synchronously inside the delivery callback: it must never suspend, otherwise a delivery
    /// can race with the iterator draining the buffer and be handed to neither.
    async fn iter(&self) -> Result<QueueIterator, anyhow::Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback: DeliveryCallback = Arc::new(move |message: IncomingMessage| {
            let on_arrival: BoxFuture<'static, ()> = match sender.send(message) {
                Ok(()) => Box::pin(future::ready(())),
                // The iterator is gone: hand the message back to the broker.
                Err(mpsc::error::SendError(message)) => Box::pin(async move {
                    if let Err(e) = message.reject(true).await {
                        tracing::warn!(error = %e, "Failed to requeue an orphaned delivery");
                    }
                }),
            };
            on_arrival
        });
        let consumer_tag = self.consume(callback).await?;
        Ok(QueueIterator::new(receiver, consumer_tag))
    }
}

/// The channel type handed out by the channel pool of a [`Connector`].
pub type ChannelOf<C> = <<C as Connector>::Connection as Connection>::Channel;
/// The queue type produced by the channels of a [`Connector`].
pub type QueueOf<C> = <ChannelOf<C> as Channel>::Queue;
