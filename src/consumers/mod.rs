//! Facilities to consume messages from a queue. Check out [`MessageListener`] as a starting
//! point.
pub use decoder::{ClosureDecoder, JsonDecoder, MessageDecoder};
pub use disposition::{classify, Disposition, Outcome};
pub use error::{DecodeError, ErrorType, HandlerError};
pub use handler::{ClosureHandler, MessageHandler};
pub use listener::{MessageListener, MessageListenerBuilder};
pub use options::{ListenerOptions, ListenerSettings};

mod decoder;
mod disposition;
mod error;
mod handler;
mod listener;
mod options;
mod scope;
