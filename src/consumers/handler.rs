//! The `MessageHandler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use std::future::Future;

use super::HandlerError;

/// Implementers of the `MessageHandler` trait process the messages consumed by a
/// [`MessageListener`], once decoded.
///
/// # Scope
///
/// `handle` does not get access to the underlying channel.
/// The listener takes care of acking/rejecting the message with the broker according to the
/// outcome of processing (check out [`HandlerError`] for more details).
/// This decouples the low-level interactions with the message broker and the retry logic from
/// the actual business logic associated with the processing of a message.
///
/// # Implementers
///
/// While you can implement `MessageHandler` for a struct or enum, most of the time you will be
/// relying on [`ClosureHandler`], our implementation for async functions with a matching
/// signature - `Fn(T) -> Fut`.
///
/// [`MessageListener`]: super::MessageListener
#[async_trait::async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> Result<(), HandlerError>;
}

/// Implement the [`MessageHandler`] trait for all boxed handlers.
///
/// E.g. `Box<dyn MessageHandler<T>>`.
#[async_trait::async_trait]
impl<T, H> MessageHandler<T> for Box<H>
where
    T: Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    async fn handle(&self, message: T) -> Result<(), HandlerError> {
        H::handle(self, message).await
    }
}

/// Wrapper type to turn an async function into a [`MessageHandler`].
///
/// Handlers are not required to return a [`HandlerError`] directly: it is enough for them to
/// return an error type that can be converted into one.
///
/// ```rust
/// use carrot_hutch::consumers::ClosureHandler;
///
/// async fn print(message: String) -> Result<(), anyhow::Error> {
///     println!("{message}");
///     Ok(())
/// }
///
/// let handler = ClosureHandler(print);
/// ```
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<T, F, Fut, E> MessageHandler<T> for ClosureHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<HandlerError>,
{
    async fn handle(&self, message: T) -> Result<(), HandlerError> {
        (self.0)(message).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consumers::ErrorType;

    async fn handler(message: u32) -> Result<(), HandlerError> {
        if message == 0 {
            return Err(HandlerError::use_requeue(anyhow::anyhow!("zero")));
        }
        Ok(())
    }

    // This asserts that the implementation of MessageHandler for Box<dyn MessageHandler>
    // calls down the chain and does not recurse.
    #[tokio::test]
    async fn test_boxed_handler() {
        let handler: Box<dyn MessageHandler<u32>> = Box::new(ClosureHandler(handler));
        assert!(handler.handle(1).await.is_ok());
        assert_eq!(
            handler.handle(0).await.unwrap_err().error_type,
            ErrorType::UseRequeue
        );
    }

    #[tokio::test]
    async fn closures_returning_foreign_errors_are_unclassified() {
        let handler = ClosureHandler(|message: String| async move {
            message.parse::<u8>().map(|_| ())
        });

        let error = handler.handle("not a number".to_string()).await.unwrap_err();

        assert_eq!(error.error_type, ErrorType::Unclassified);
    }
}
