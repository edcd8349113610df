use super::{ErrorType, ListenerOptions};

/// What happened to a delivery before it was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The payload could not be decoded: the handler was not invoked.
    InvalidMessage,
    /// The handler completed successfully.
    Handled,
    /// The handler failed.
    Failed(ErrorType),
    /// The listener was stopped while the handler was running.
    Cancelled,
}

/// How a delivery is settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Map the outcome of processing a delivery to its disposition.
///
/// Explicit signals from the handler always win over the listener's options:
/// [`ErrorType::UseRequeue`] requeues and [`ErrorType::AvoidRequeue`] discards, whatever
/// `requeue_on_error` says.
pub fn classify(outcome: Outcome, options: &ListenerOptions) -> Disposition {
    match outcome {
        Outcome::Handled => Disposition::Ack,
        Outcome::InvalidMessage => Disposition::Reject {
            requeue: options.requeue_on_invalid_message,
        },
        Outcome::Cancelled | Outcome::Failed(ErrorType::UseRequeue) => {
            Disposition::Reject { requeue: true }
        }
        Outcome::Failed(ErrorType::AvoidRequeue) => Disposition::Reject { requeue: false },
        Outcome::Failed(ErrorType::Unclassified) => Disposition::Reject {
            requeue: options.requeue_on_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(requeue_on_error: bool, requeue_on_invalid_message: bool) -> ListenerOptions {
        ListenerOptions {
            requeue_on_error,
            requeue_on_invalid_message,
            ..ListenerOptions::default()
        }
    }

    #[test]
    fn explicit_signals_ignore_the_requeue_on_error_option() {
        for requeue_on_error in [true, false] {
            let options = options(requeue_on_error, false);
            assert_eq!(
                classify(Outcome::Failed(ErrorType::UseRequeue), &options),
                Disposition::Reject { requeue: true }
            );
            assert_eq!(
                classify(Outcome::Failed(ErrorType::AvoidRequeue), &options),
                Disposition::Reject { requeue: false }
            );
            assert_eq!(
                classify(Outcome::Cancelled, &options),
                Disposition::Reject { requeue: true }
            );
        }
    }

    #[test]
    fn unclassified_failures_follow_requeue_on_error() {
        assert_eq!(
            classify(Outcome::Failed(ErrorType::Unclassified), &options(true, false)),
            Disposition::Reject { requeue: true }
        );
        assert_eq!(
            classify(Outcome::Failed(ErrorType::Unclassified), &options(false, true)),
            Disposition::Reject { requeue: false }
        );
    }

    #[test]
    fn invalid_messages_follow_requeue_on_invalid_message() {
        assert_eq!(
            classify(Outcome::InvalidMessage, &options(false, true)),
            Disposition::Reject { requeue: true }
        );
        assert_eq!(
            classify(Outcome::InvalidMessage, &options(true, false)),
            Disposition::Reject { requeue: false }
        );
    }

    #[test]
    fn handled_messages_are_acked() {
        assert_eq!(
            classify(Outcome::Handled, &options(true, true)),
            Disposition::Ack
        );
    }
}
