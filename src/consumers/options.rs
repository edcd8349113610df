use serde::Deserialize;

/// How a [`MessageListener`](super::MessageListener) consumes its queue and what it does with
/// the messages it fails to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    /// Requeue messages whose handler failed with an unclassified error.
    ///
    /// Default: `false`.
    pub requeue_on_error: bool,
    /// Requeue messages that could not be decoded.
    ///
    /// Default: `false`.
    pub requeue_on_invalid_message: bool,
    /// Push mode (`true`): the transport invokes the listener for every delivery, messages are
    /// processed concurrently.
    /// Pull mode (`false`): a background task pulls messages one at a time and processes them in
    /// order.
    ///
    /// Default: `true`.
    pub consume_async: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            requeue_on_error: false,
            requeue_on_invalid_message: false,
            consume_async: true,
        }
    }
}

/// Configuration for a [`MessageListener`](super::MessageListener), including the queue it
/// consumes from.
///
/// ```rust
/// use carrot_hutch::consumers::ListenerSettings;
///
/// let settings: ListenerSettings = serde_json::from_value(serde_json::json!({
///     "queue_name": "payments",
///     "prefetch_count": 16,
///     "requeue_on_error": true
/// })).unwrap();
///
/// assert!(settings.options.requeue_on_error);
/// assert!(settings.options.consume_async);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ListenerSettings {
    pub queue_name: String,
    /// Maximum number of unacknowledged deliveries pushed to the listener.
    /// If omitted the channel's current setting is left untouched.
    #[serde(default)]
    pub prefetch_count: Option<u16>,
    #[serde(flatten)]
    pub options: ListenerOptions,
}
