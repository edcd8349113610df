use std::fmt;

/// The error type returned by message handlers.
///
/// `error_type` tells the listener what to do with the message that could not be handled.
/// Any error convertible into an [`anyhow::Error`] converts into an
/// [`ErrorType::Unclassified`] `HandlerError`, so `?` works out of the box in handlers:
///
/// ```rust
/// use carrot_hutch::consumers::HandlerError;
///
/// async fn handle(payload: String) -> Result<(), HandlerError> {
///     let amount: u64 = payload.parse()?; // Unclassified
///     if amount == 0 {
///         return Err(HandlerError::avoid_requeue(anyhow::anyhow!("Empty transfer")));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
    /// Check out [`ErrorType`]'s documentation for the available classes of errors.
    pub error_type: ErrorType,
}

impl HandlerError {
    /// The failure is transient: the message is requeued, whatever the listener's options.
    pub fn use_requeue(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::UseRequeue,
        }
    }

    /// The message can never be handled: it is discarded, whatever the listener's options.
    pub fn avoid_requeue(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::AvoidRequeue,
        }
    }
}

// `HandlerError` deliberately does not implement `std::error::Error`: it would conflict with
// this blanket conversion.
impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Unclassified,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue.\n{}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Processing might succeed if retried: the message is rejected with requeue.
    ///
    /// E.g. the handler timed out calling an API it depends on.
    UseRequeue,
    /// Processing will never succeed, no matter how many times you retry: the message is
    /// rejected without requeue.
    ///
    /// E.g. the message refers to an entity that does not exist.
    AvoidRequeue,
    /// Anything else. The listener's `requeue_on_error` option decides.
    Unclassified,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UseRequeue => write!(f, "transient"),
            Self::AvoidRequeue => write!(f, "fatal"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// The payload of a message could not be decoded into the type expected by the handler.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for DecodeError {
    fn default() -> Self {
        Self::new("Failed to decode AMQP message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_conversions_are_unclassified() {
        fn parse(raw: &str) -> Result<u32, HandlerError> {
            Ok(raw.parse::<u32>()?)
        }

        let error = parse("not a number").unwrap_err();

        assert_eq!(error.error_type, ErrorType::Unclassified);
        assert!(error.inner_error.downcast_ref::<std::num::ParseIntError>().is_some());
    }

    #[test]
    fn explicit_constructors_set_the_error_type() {
        assert_eq!(
            HandlerError::use_requeue(anyhow::anyhow!("timeout")).error_type,
            ErrorType::UseRequeue
        );
        assert_eq!(
            HandlerError::avoid_requeue(anyhow::anyhow!("gone")).error_type,
            ErrorType::AvoidRequeue
        );
    }

    #[test]
    fn decode_errors_have_a_default_message() {
        assert_eq!(DecodeError::default().to_string(), "Failed to decode AMQP message");
    }
}
