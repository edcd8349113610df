//! Pooling for connections and channels.
//!
//! This module provides two key guarantees:
//! - Disposing of broken channels and recreating new ones on-demand.
//! - Reusing connection objects across channels to limit overhead.
//!
//! [`ResourcePool`] is generic over a [`Manager`]: [`ConnectionManager`] and
//! [`ChannelManager`] plug any [`Connector`](crate::transport::Connector) into it.
//!
//! ```rust
//! use carrot_hutch::pool::{ChannelManager, ChannelPool, ConnectionManager, ConnectionPool};
//! use carrot_hutch::transport::memory::MemoryBroker;
//! use carrot_hutch::transport::Channel;
//!
//! async fn example() -> anyhow::Result<()> {
//!     // determine the maximum underlying connections.
//!     let max_connections = 16;
//!
//!     let connection_pool = ConnectionPool::builder(ConnectionManager::new(MemoryBroker::new()))
//!         .max_size(max_connections)
//!         .build()?;
//!
//!     let pool = ChannelPool::builder(ChannelManager::new(connection_pool))
//!         .max_size(64)
//!         .build()?;
//!
//!     // get a new Channel from the pool.
//!     let channel = pool.acquire().await?;
//!     assert!(!channel.is_closed());
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod resource_pool;

pub use channel::{ChannelManager, ChannelPool};
pub use connection::{ConnectionManager, ConnectionPool};
pub use error::{Error, PoolError};
pub use resource_pool::{
    Manager, PoolStatus, Pooled, ResourcePool, ResourcePoolBuilder, DEFAULT_DRAIN_TIMEOUT,
};
