//! `carrot-hutch` keeps pools of RabbitMq connections and channels healthy and consumes queues
//! with requeue-aware message listeners, built on top of [`lapin`].
//!
//! - [`ConnectionHolder`] owns a connection pool and a channel pool layered on top of it;
//! - [`publishers::PublishMessage`] publishes through the holder or an explicit channel;
//! - [`consumers::MessageListener`] decodes, handles and settles every delivery of a queue;
//! - [`lifecycle::ServiceGroup`] starts and stops all of the above together.
//!
//! Everything is written against the [`transport`] traits: swap
//! [`amqp::ConnectionFactory`] for [`transport::memory::MemoryBroker`] to run without a broker.
//!
//! ```rust
//! use std::sync::Arc;
//! use carrot_hutch::consumers::{ClosureHandler, JsonDecoder, ListenerSettings, MessageListener};
//! use carrot_hutch::publishers::PublishMessage;
//! use carrot_hutch::transport::memory::MemoryBroker;
//! use carrot_hutch::transport::Message;
//! use carrot_hutch::{ConnectionHolder, PoolSizes};
//!
//! #[derive(serde::Deserialize)]
//! struct Greeting {
//!     name: String,
//! }
//!
//! async fn greet(greeting: Greeting) -> Result<(), anyhow::Error> {
//!     println!("Hello {}!", greeting.name);
//!     Ok(())
//! }
//!
//! async fn example() -> Result<(), anyhow::Error> {
//!     let holder = ConnectionHolder::new(MemoryBroker::new(), PoolSizes::default());
//!     holder.start()?;
//!
//!     let channel = holder.acquire_channel().await?;
//!     let settings = ListenerSettings {
//!         queue_name: "greetings".into(),
//!         prefetch_count: Some(8),
//!         options: Default::default(),
//!     };
//!     let listener = MessageListener::from_settings(
//!         &*channel,
//!         &settings,
//!         JsonDecoder::<Greeting>::new(),
//!         ClosureHandler(greet),
//!     )
//!     .await?;
//!     listener.start().await?;
//!
//!     let message = Message::json(&serde_json::json!({ "name": "Ferris" }))?;
//!     PublishMessage::new(message, "", "greetings")
//!         .via_holder(&holder)
//!         .send()
//!         .await?;
//!
//!     listener.stop().await?;
//!     holder.stop().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod consumers;
pub mod lifecycle;
pub mod pool;
pub mod publishers;
pub mod transport;

mod holder;

pub use holder::{ConnectionHolder, ConnectionHolderError, HolderStatus, PoolSizes, PooledChannel};
