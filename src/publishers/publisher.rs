use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use crate::holder::{ConnectionHolder, ConnectionHolderError};
use crate::transport::{Channel, ChannelOf, Connector, Exchange, Message};

/// Where a message is published from.
pub enum PublishTarget<'a, C: Connector + Clone> {
    /// A channel is checked out of the holder's pool for the duration of the publish.
    Holder(&'a ConnectionHolder<C>),
    /// A channel owned by the caller. It is used as is and left open.
    Channel(&'a ChannelOf<C>),
}

/// Publish a message to an exchange.
///
/// # Exchange declaration
///
/// With `create_exchange_with_memory_leak` set to `false` the exchange must already exist:
/// publishing to a missing exchange fails.
/// With `true` the exchange is declared (durable, direct) if absent. Every channel remembers the
/// exchanges it declared: publishing to dynamically-named exchanges grows that set without
/// bound, hence the name of the flag and its default.
///
/// Errors are returned as they are: there are no retries.
///
/// # Example
///
/// ```rust
/// use carrot_hutch::publishers::PublishMessage;
/// use carrot_hutch::transport::Message;
/// use carrot_hutch::transport::memory::MemoryBroker;
/// use carrot_hutch::ConnectionHolder;
///
/// # async fn example(holder: &ConnectionHolder<MemoryBroker>) -> anyhow::Result<()> {
/// PublishMessage::new(Message::new("hello"), "greetings", "greeting.created")
///     .via_holder(holder)
///     .create_exchange_with_memory_leak(true)
///     .send()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[must_use = "nothing is published until `send` is called"]
pub struct PublishMessage<'a, C: Connector + Clone> {
    message: Message,
    exchange_name: String,
    routing_key: String,
    holder: Option<&'a ConnectionHolder<C>>,
    channel: Option<&'a ChannelOf<C>>,
    create_exchange_with_memory_leak: bool,
}

impl<'a, C: Connector + Clone> PublishMessage<'a, C> {
    pub fn new(
        message: Message,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            message,
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            holder: None,
            channel: None,
            create_exchange_with_memory_leak: false,
        }
    }

    /// Borrow a channel from `holder` for the duration of the publish.
    pub fn via_holder(mut self, holder: &'a ConnectionHolder<C>) -> Self {
        self.holder = Some(holder);
        self
    }

    /// Publish on a channel owned by the caller. Takes precedence over a holder.
    pub fn via_channel(mut self, channel: &'a ChannelOf<C>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Declare the exchange if it does not exist. Default: `false`.
    pub fn create_exchange_with_memory_leak(mut self, create: bool) -> Self {
        self.create_exchange_with_memory_leak = create;
        self
    }

    #[tracing::instrument(name = "publish_message", skip(self), fields(exchange = %self.exchange_name, routing_key = %self.routing_key))]
    pub async fn send(self) -> Result<(), PublisherError> {
        let message = inject_amqp_properties(self.message);
        let ensure = self.create_exchange_with_memory_leak;
        match (self.channel, self.holder) {
            (Some(channel), _) => {
                publish_on(channel, message, &self.exchange_name, &self.routing_key, ensure).await
            }
            (None, Some(holder)) => {
                let channel = holder
                    .acquire_channel()
                    .await
                    .map_err(PublisherError::Channel)?;
                publish_on(&*channel, message, &self.exchange_name, &self.routing_key, ensure)
                    .await
            }
            (None, None) => Err(PublisherError::MissingTarget),
        }
    }
}

/// Publish a message in one call. See [`PublishMessage`] for the semantics.
pub async fn publish_message<C: Connector + Clone>(
    target: PublishTarget<'_, C>,
    message: Message,
    exchange_name: &str,
    routing_key: &str,
    create_exchange_with_memory_leak: bool,
) -> Result<(), PublisherError> {
    let builder = PublishMessage::new(message, exchange_name, routing_key)
        .create_exchange_with_memory_leak(create_exchange_with_memory_leak);
    match target {
        PublishTarget::Holder(holder) => builder.via_holder(holder),
        PublishTarget::Channel(channel) => builder.via_channel(channel),
    }
    .send()
    .await
}

async fn publish_on<Ch: Channel>(
    channel: &Ch,
    message: Message,
    exchange_name: &str,
    routing_key: &str,
    ensure: bool,
) -> Result<(), PublisherError> {
    let exchange = channel
        .get_exchange(exchange_name, ensure)
        .await
        .map_err(PublisherError::Exchange)?;
    exchange
        .publish(message, routing_key)
        .await
        .map_err(PublisherError::Publish)
}

/// Error returned when trying to publish a message.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Either a connection holder or a channel must be provided to publish a message")]
    MissingTarget,
    #[error("Failed to get a channel from the connection holder")]
    Channel(#[source] ConnectionHolderError),
    #[error("Failed to resolve the exchange")]
    Exchange(#[source] anyhow::Error),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Publish(#[source] anyhow::Error),
}

/// Set the current timestamp and a fresh message id, unless the message already has them.
fn inject_amqp_properties(mut message: Message) -> Message {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = message.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    message.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    message
}
