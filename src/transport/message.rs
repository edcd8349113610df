use amq_protocol_types::{AMQPValue, DeliveryTag, FieldTable, ShortString};
use lapin::BasicProperties;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ConsumerTag;

/// A message to be published.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// AMQP properties (headers, content type, message id, etc.) attached to the message.
    pub properties: BasicProperties,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: BasicProperties::default(),
        }
    }

    /// Serialize `value` as JSON and set the content type accordingly.
    pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?).with_content_type("application/json".into()))
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    /// Add a single header, keeping the ones already set.
    pub fn with_header(self, name: &str, value: AMQPValue) -> Self {
        self.props(|p| crate::amqp::convenience::set_header(p, name, value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }
}

/// Settles a delivery with the broker.
///
/// Implemented by each transport; users of the crate never call it directly; the listener
/// settles every delivery it receives.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

/// Error returned when settling a delivery.
#[derive(thiserror::Error, Debug)]
pub enum DispositionError {
    /// A disposition (ack or reject) was already issued for this delivery.
    #[error("The message has already been acknowledged or rejected")]
    AlreadyProcessed,
    /// The broker could not be told about the disposition.
    #[error("Failed to settle the message with the broker")]
    Broker(#[source] anyhow::Error),
}

struct Settlement {
    acker: Box<dyn Acker>,
    processed: AtomicBool,
}

/// A message delivered by the broker, waiting to be decoded and handled.
pub struct IncomingMessage {
    /// The delivery tag of the message, unique within its channel.
    pub delivery_tag: DeliveryTag,
    /// The exchange the message was published to. Empty for the default exchange.
    pub exchange: String,
    /// The routing key of the message.
    pub routing_key: String,
    /// Whether this message was delivered before and requeued.
    pub redelivered: bool,
    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
    /// The consumer this message was delivered to.
    pub consumer_tag: ConsumerTag,
    // Hidden from the public interface: a delivery must be acked/rejected at most once
    // (https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag) and the
    // listener owns that decision.
    settlement: Arc<Settlement>,
}

impl IncomingMessage {
    /// Build a delivery for a transport implementation.
    pub fn new(
        delivery_tag: DeliveryTag,
        consumer_tag: ConsumerTag,
        data: Vec<u8>,
        acker: impl Acker,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            data,
            consumer_tag,
            settlement: Arc::new(Settlement {
                acker: Box::new(acker),
                processed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn with_routing(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// `true` if an ack or a reject has already been issued for this delivery.
    pub fn is_processed(&self) -> bool {
        self.settlement.processed.load(Ordering::Acquire)
    }

    /// Positively acknowledge the message: the broker removes it from the queue.
    pub(crate) async fn ack(&self) -> Result<(), DispositionError> {
        self.settlement.claim()?;
        self.settlement
            .acker
            .ack()
            .await
            .map_err(DispositionError::Broker)
    }

    /// Reject the message. With `requeue` the broker makes it available again for delivery,
    /// otherwise it is discarded (or dead-lettered, if the queue is configured to do so).
    pub(crate) async fn reject(&self, requeue: bool) -> Result<(), DispositionError> {
        self.settlement.claim()?;
        self.settlement
            .acker
            .reject(requeue)
            .await
            .map_err(DispositionError::Broker)
    }

    /// A second handle on the same delivery, able to settle it.
    pub(crate) fn settlement_handle(&self) -> SettlementHandle {
        SettlementHandle(Arc::clone(&self.settlement))
    }
}

impl Settlement {
    fn claim(&self) -> Result<(), DispositionError> {
        self.processed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| DispositionError::AlreadyProcessed)
    }
}

/// Shares the settlement state of an [`IncomingMessage`] without its payload.
#[derive(Clone)]
pub(crate) struct SettlementHandle(Arc<Settlement>);

impl SettlementHandle {
    pub(crate) fn is_processed(&self) -> bool {
        self.0.processed.load(Ordering::Acquire)
    }

    pub(crate) async fn reject(&self, requeue: bool) -> Result<(), DispositionError> {
        self.0.claim()?;
        self.0
            .acker
            .reject(requeue)
            .await
            .map_err(DispositionError::Broker)
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("consumer_tag", &self.consumer_tag)
            .field("data_len", &self.data.len())
            .field("processed", &self.is_processed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait::async_trait]
    impl Acker for Recorder {
        async fn ack(&self) -> Result<(), anyhow::Error> {
            self.0.lock().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
            self.0
                .lock()
                .push(if requeue { "requeue" } else { "discard" });
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_delivery_can_only_be_settled_once() {
        let recorder = Recorder::default();
        let message = IncomingMessage::new(1, ConsumerTag::generate(), vec![], recorder.clone());

        message.ack().await.unwrap();
        let second = message.reject(true).await;

        assert!(matches!(second, Err(DispositionError::AlreadyProcessed)));
        assert!(message.is_processed());
        assert_eq!(*recorder.0.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn the_settlement_handle_shares_state_with_the_message() {
        let recorder = Recorder::default();
        let message = IncomingMessage::new(7, ConsumerTag::generate(), vec![], recorder.clone());
        let handle = message.settlement_handle();

        handle.reject(true).await.unwrap();

        assert!(message.is_processed());
        assert!(matches!(
            message.ack().await,
            Err(DispositionError::AlreadyProcessed)
        ));
        assert_eq!(*recorder.0.lock(), vec!["requeue"]);
    }

    #[test]
    fn json_messages_carry_a_content_type() {
        let message = Message::json(&serde_json::json!({ "id": 1 })).unwrap();

        assert_eq!(
            message.properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
        assert_eq!(message.payload, br#"{"id":1}"#.to_vec());
    }
}
