//! [`lapin`]-backed implementations of the transport traits.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use crate::transport::{
    Access, Acker, Channel, Connection, ConsumerTag, DeliveryCallback, Durability, Exchange,
    IncomingMessage, Message, Queue, QueueOptions,
};
use futures_util::future::{self, BoxFuture};
use lapin::{
    message::{BasicReturnMessage, DeliveryResult},
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    ExchangeKind,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A connection to a RabbitMq broker.
///
/// Connections should be re-used across multiple actions given the initial setup cost.
pub struct AmqpConnection {
    inner: lapin::Connection,
    publisher_confirms: bool,
}

impl AmqpConnection {
    pub(crate) fn new(inner: lapin::Connection, publisher_confirms: bool) -> Self {
        Self {
            inner,
            publisher_confirms,
        }
    }

    /// Get access to the underlying raw connection
    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<AmqpChannel, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        if self.publisher_confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(AmqpChannel {
            inner: channel,
            publisher_confirms: self.publisher_confirms,
            declared_exchanges: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner.close(200, "Bye").await?;
        Ok(())
    }
}

/// A RabbitMq channel.
///
/// Clones share the underlying channel and its set of declared exchanges.
#[derive(Clone)]
pub struct AmqpChannel {
    inner: lapin::Channel,
    publisher_confirms: bool,
    declared_exchanges: Arc<Mutex<HashSet<String>>>,
}

impl AmqpChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }

    /// Create a durable RabbitMq direct exchange.
    #[tracing::instrument(name = "rabbitmq_create_durable_exchange", skip(self))]
    async fn create_durable_exchange(&self, exchange: &str) -> Result<(), lapin::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            // The exchange will survive RabbitMq server restarts
            durable: true,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        self.inner
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
    }
}

#[async_trait::async_trait]
impl Channel for AmqpChannel {
    type Exchange = AmqpExchange;
    type Queue = AmqpQueue;

    async fn get_exchange(&self, name: &str, ensure: bool) -> Result<AmqpExchange, anyhow::Error> {
        // The default exchange always exists and cannot be declared.
        if ensure && !name.is_empty() && !self.declared_exchanges.lock().contains(name) {
            self.create_durable_exchange(name).await?;
            self.declared_exchanges.lock().insert(name.to_owned());
        }
        Ok(AmqpExchange {
            channel: self.inner.clone(),
            publisher_confirms: self.publisher_confirms,
            name: name.to_owned(),
        })
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<AmqpQueue, anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durability == Durability::Durable,
            exclusive: options.access == Access::Exclusive,
            auto_delete: false,
            nowait: false,
        };
        self.inner
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(AmqpQueue {
            channel: self.inner.clone(),
            name: name.to_owned(),
        })
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), anyhow::Error> {
        let options = QueueBindOptions { nowait: false };
        self.inner
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch_count(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner.close(200, "Bye").await?;
        Ok(())
    }
}

/// Error returned when trying to publish a message via RabbitMq.
#[derive(thiserror::Error, Debug)]
pub enum RabbitMqPublishError {
    #[error("Generic error encountered when interacting with the RabbitMq broker.")]
    GenericError(#[source] lapin::Error),
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
}

/// An exchange resolved through an [`AmqpChannel`].
pub struct AmqpExchange {
    channel: lapin::Channel,
    publisher_confirms: bool,
    name: String,
}

impl AmqpExchange {
    /// Publish a payload on the exchange, waiting for publisher confirmation from the
    /// RabbitMq broker if enabled on the channel.
    #[tracing::instrument(level = "debug", name = "rabbitmq_publish", skip(self, message), fields(exchange = %self.name))]
    async fn publish_message(&self, message: Message, routing_key: &str) -> Result<(), RabbitMqPublishError> {
        let options = BasicPublishOptions {
            // This flag tells the server how to react if the message cannot be routed to a queue.
            // If this flag is `true`, the server will return an unroutable message with a Return method.
            // If this flag is `false`, the server silently drops the message.
            mandatory: self.publisher_confirms,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        // Delivery mode: Non-persistent (1) or persistent (2).
        let properties = message.properties.with_delivery_mode(2);
        let confirm = self
            .channel
            .basic_publish(&self.name, routing_key, options, &message.payload, properties)
            .await
            .map_err(RabbitMqPublishError::GenericError)?
            .await
            .map_err(RabbitMqPublishError::GenericError)?;

        match confirm {
            Confirmation::Ack(Some(return_message)) => {
                // Reply Code 312 - NO_ROUTE
                // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                if return_message.reply_code == 312 {
                    return Err(RabbitMqPublishError::UnroutableMessage(return_message));
                }
                Ok(())
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(nack) => Err(RabbitMqPublishError::NegativeAck(nack)),
        }
    }
}

#[async_trait::async_trait]
impl Exchange for AmqpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: Message, routing_key: &str) -> Result<(), anyhow::Error> {
        Ok(self.publish_message(message, routing_key).await?)
    }
}

/// A queue resolved through an [`AmqpChannel`].
pub struct AmqpQueue {
    channel: lapin::Channel,
    name: String,
}

#[async_trait::async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip_all, fields(queue_name = %self.name))]
    async fn consume(&self, callback: DeliveryCallback) -> Result<ConsumerTag, anyhow::Error> {
        let consumer_tag = ConsumerTag::generate();
        let consumer = self
            .channel
            .basic_consume(
                &self.name,
                consumer_tag.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let queue_name = self.name.clone();
        let tag = consumer_tag.clone();
        consumer.set_delegate(move |delivery: DeliveryResult| -> BoxFuture<'static, ()> {
            match delivery {
                Ok(Some(delivery)) => {
                    let acker = LapinAcker(delivery.acker);
                    let message = IncomingMessage::new(
                        delivery.delivery_tag,
                        tag.clone(),
                        delivery.data,
                        acker,
                    )
                    .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str())
                    .with_properties(delivery.properties)
                    .redelivered(delivery.redelivered);
                    callback(message)
                }
                // The consumer was cancelled.
                Ok(None) => Box::pin(future::ready(())),
                Err(e) => {
                    tracing::error!(error = ?e, queue_name = %queue_name, "The RabbitMq consumer failed");
                    Box::pin(future::ready(()))
                }
            }
        });
        Ok(consumer_tag)
    }

    #[tracing::instrument(name = "rabbitmq_cancel", skip_all, fields(queue_name = %self.name, consumer_tag = %consumer_tag))]
    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<(), anyhow::Error> {
        self.channel
            .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
