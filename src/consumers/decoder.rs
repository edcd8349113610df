use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use super::DecodeError;
use crate::transport::IncomingMessage;

/// Turns the payload of a delivery into the value handed to a [`MessageHandler`].
///
/// Fail with a [`DecodeError`] when the payload is malformed: the handler is not invoked and
/// the listener's `requeue_on_invalid_message` option decides what happens to the message.
///
/// [`MessageHandler`]: super::MessageHandler
#[async_trait::async_trait]
pub trait MessageDecoder<T>: Send + Sync + 'static {
    async fn decode(&self, message: &IncomingMessage) -> Result<T, DecodeError>;
}

#[async_trait::async_trait]
impl<T, D> MessageDecoder<T> for Box<D>
where
    T: 'static,
    D: MessageDecoder<T> + ?Sized,
{
    async fn decode(&self, message: &IncomingMessage) -> Result<T, DecodeError> {
        D::decode(self, message).await
    }
}

/// Wrapper type to turn a function into a [`MessageDecoder`].
///
/// ```rust
/// use carrot_hutch::consumers::{ClosureDecoder, DecodeError};
/// use carrot_hutch::transport::IncomingMessage;
///
/// let decoder = ClosureDecoder(|message: &IncomingMessage| {
///     String::from_utf8(message.data.clone()).map_err(|_| DecodeError::new("Not UTF-8"))
/// });
/// ```
pub struct ClosureDecoder<F>(pub F);

#[async_trait::async_trait]
impl<T, F> MessageDecoder<T> for ClosureDecoder<F>
where
    T: Send + 'static,
    F: Fn(&IncomingMessage) -> Result<T, DecodeError> + Send + Sync + 'static,
{
    async fn decode(&self, message: &IncomingMessage) -> Result<T, DecodeError> {
        (self.0)(message)
    }
}

/// Deserializes JSON payloads with `serde_json`.
pub struct JsonDecoder<T>(PhantomData<fn() -> T>);

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T> MessageDecoder<T> for JsonDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn decode(&self, message: &IncomingMessage) -> Result<T, DecodeError> {
        serde_json::from_slice(&message.data)
            .map_err(|e| DecodeError::new(format!("Failed to decode AMQP message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Acker, ConsumerTag};

    struct NoopAcker;

    #[async_trait::async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn reject(&self, _requeue: bool) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    fn delivery(payload: &[u8]) -> IncomingMessage {
        IncomingMessage::new(1, ConsumerTag::generate(), payload.to_vec(), NoopAcker)
    }

    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Transfer {
        id: u64,
        currency: String,
    }

    #[tokio::test]
    async fn json_payloads_are_deserialized() {
        let decoder = JsonDecoder::<Transfer>::new();

        let transfer = decoder
            .decode(&delivery(br#"{"id": 7, "currency": "GBP"}"#))
            .await
            .unwrap();

        assert_eq!(
            transfer,
            Transfer {
                id: 7,
                currency: "GBP".into()
            }
        );
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let decoder = JsonDecoder::<Transfer>::new();

        let error = decoder.decode(&delivery(b"{")).await.unwrap_err();

        assert!(error.message.starts_with("Failed to decode AMQP message"));
    }

    #[tokio::test]
    async fn boxed_decoders_delegate_to_the_inner_decoder() {
        let decoder: Box<dyn MessageDecoder<usize>> =
            Box::new(ClosureDecoder(|m: &IncomingMessage| {
                Ok::<_, DecodeError>(m.data.len())
            }));

        assert_eq!(decoder.decode(&delivery(b"abc")).await.unwrap(), 3);
    }
}
