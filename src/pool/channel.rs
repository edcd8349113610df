//! Implements [`Manager`] for the channels opened on pooled connections.
use super::connection::ConnectionPool;
use super::resource_pool::{Manager, ResourcePool};
use crate::transport::{Channel, ChannelOf, Connection, Connector};

/// `ChannelPool` pools the channels opened on the connections of a [`ConnectionPool`].
pub type ChannelPool<C> = ResourcePool<ChannelManager<C>>;

/// `ChannelManager` implements [`Manager`] to manage a pool of channels.
///
/// `ChannelManager` keeps an internal [`ConnectionPool`] in order to reuse connections across
/// channels. A connection is borrowed only for as long as it takes to open a channel on it:
/// the channel pool slot and the connection pool slot are independent.
pub struct ChannelManager<C: Connector> {
    connection_pool: ConnectionPool<C>,
}

impl<C: Connector> ChannelManager<C> {
    pub fn new(connection_pool: ConnectionPool<C>) -> Self {
        Self { connection_pool }
    }

    pub fn connection_pool(&self) -> &ConnectionPool<C> {
        &self.connection_pool
    }
}

#[async_trait::async_trait]
impl<C: Connector> Manager for ChannelManager<C> {
    type Resource = ChannelOf<C>;

    async fn create(&self) -> Result<ChannelOf<C>, super::Error> {
        let connection = self.connection_pool.acquire().await?;
        Ok(connection.create_channel().await?)
    }

    async fn recycle(&self, channel: &mut ChannelOf<C>) -> Result<(), super::Error> {
        if channel.is_closed() {
            return Err(anyhow::anyhow!("Channel is not in an healthy state").into());
        }
        Ok(())
    }

    async fn close(&self, channel: ChannelOf<C>) -> Result<(), super::Error> {
        Ok(channel.close().await?)
    }
}
