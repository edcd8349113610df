//! Helpers for connecting to a RabbitMq broker, built on top of [`lapin`].
//!
//! [`lapin`]: https://docs.rs/crate/lapin

mod channel;
pub mod configuration;
pub mod convenience;
mod factory;

pub use channel::{AmqpChannel, AmqpConnection, AmqpExchange, AmqpQueue, RabbitMqPublishError};
pub use factory::ConnectionFactory;

pub use lapin::{options, types, BasicProperties};
