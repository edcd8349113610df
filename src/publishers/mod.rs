//! Facilities to publish messages to an exchange. Check out [`PublishMessage`] as a starting point.
mod publisher;

pub use publisher::{publish_message, PublishMessage, PublishTarget, PublisherError};
