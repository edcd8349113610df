//! A connection pool and a channel pool layered on top of it.
use std::time::Duration;

use parking_lot::RwLock;

use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::ConnectionFactory;
use crate::lifecycle::Service;
use crate::pool::{
    ChannelManager, ChannelPool, ConnectionManager, ConnectionPool, PoolError, PoolStatus, Pooled,
    DEFAULT_DRAIN_TIMEOUT,
};
use crate::transport::{Channel, Connector};

/// A channel checked out from a [`ConnectionHolder`].
pub type PooledChannel<C> = Pooled<ChannelManager<C>>;

/// Sizing of the pools owned by a [`ConnectionHolder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizes {
    /// The maximum number of connections open towards the broker.
    pub connections: usize,
    /// The maximum number of channels checked out at the same time.
    pub channels: usize,
    /// How long `stop` waits for checked-out resources, per pool.
    pub drain_timeout: Duration,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            connections: 10,
            channels: 100,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl From<&RabbitMqSettings> for PoolSizes {
    fn from(settings: &RabbitMqSettings) -> Self {
        Self {
            connections: settings.connection_pool_size,
            channels: settings.channel_pool_size,
            ..Self::default()
        }
    }
}

/// Snapshot of the pools of a started [`ConnectionHolder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HolderStatus {
    pub connections: PoolStatus,
    pub channels: PoolStatus,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionHolderError {
    #[error("The connection holder has not been started")]
    NotStarted,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Owns the connections and the channels used to talk to a broker.
///
/// Channels are created by borrowing a connection from the connection pool for the duration
/// of the channel creation only: many channels are multiplexed over a handful of connections.
///
/// Build one per application and pass it by reference to publishers and listeners.
///
/// ```rust
/// use carrot_hutch::{ConnectionHolder, PoolSizes};
/// use carrot_hutch::transport::memory::MemoryBroker;
/// use carrot_hutch::transport::Channel;
///
/// # async fn example() -> anyhow::Result<()> {
/// let holder = ConnectionHolder::new(MemoryBroker::new(), PoolSizes::default());
/// holder.start()?;
///
/// let channel = holder.acquire_channel().await?;
/// assert!(!channel.is_closed());
/// holder.release_channel(channel);
///
/// holder.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionHolder<C: Connector + Clone> {
    connector: C,
    sizes: PoolSizes,
    pools: RwLock<Option<Pools<C>>>,
}

struct Pools<C: Connector> {
    connections: ConnectionPool<C>,
    channels: ChannelPool<C>,
}

impl ConnectionHolder<ConnectionFactory> {
    /// A holder talking to the RabbitMq broker described by `settings`.
    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        Ok(Self::new(
            ConnectionFactory::new_from_config(settings)?,
            settings.into(),
        ))
    }
}

impl<C: Connector + Clone> ConnectionHolder<C> {
    pub fn new(connector: C, sizes: PoolSizes) -> Self {
        Self {
            connector,
            sizes,
            pools: RwLock::new(None),
        }
    }

    pub fn sizes(&self) -> PoolSizes {
        self.sizes
    }

    /// Set up the connection pool and the channel pool.
    ///
    /// Connections and channels are opened lazily, on first use.
    /// Starting a holder twice without stopping it in between is not supported: the pools of
    /// the first start are dropped without being closed.
    #[tracing::instrument(name = "connection_holder_start", skip(self), fields(connections = self.sizes.connections, channels = self.sizes.channels))]
    pub fn start(&self) -> Result<(), ConnectionHolderError> {
        tracing::debug!("Initialising the connection pools");
        let connections = ConnectionPool::builder(ConnectionManager::new(self.connector.clone()))
            .max_size(self.sizes.connections)
            .drain_timeout(self.sizes.drain_timeout)
            .build()
            .map_err(PoolError::Backend)?;
        let channels = ChannelPool::builder(ChannelManager::new(connections.clone()))
            .max_size(self.sizes.channels)
            .drain_timeout(self.sizes.drain_timeout)
            .build()
            .map_err(PoolError::Backend)?;
        *self.pools.write() = Some(Pools {
            connections,
            channels,
        });
        tracing::debug!("Connection pools initialised");
        Ok(())
    }

    /// Close the channel pool, then the connection pool.
    ///
    /// Channels go first: they need their connection to be open to be closed cleanly.
    /// Stopping a holder that is not running is a no-op.
    #[tracing::instrument(name = "connection_holder_stop", skip(self))]
    pub async fn stop(&self) {
        let Some(pools) = self.pools.write().take() else {
            return;
        };
        tracing::debug!("Closing the connection pools");
        pools.channels.close().await;
        pools.connections.close().await;
        tracing::debug!("Connection pools closed");
    }

    pub fn is_started(&self) -> bool {
        self.pools.read().is_some()
    }

    /// `true` if a channel can be checked out and is open.
    pub async fn health_check(&self) -> bool {
        match self.acquire_channel().await {
            Ok(channel) => !channel.is_closed(),
            Err(e) => {
                tracing::warn!(error = %e, "Connection holder health check failed");
                false
            }
        }
    }

    /// Check out a channel for use across multiple operations.
    ///
    /// The channel goes back to the pool when the returned guard is dropped, or via
    /// [`ConnectionHolder::release_channel`].
    pub async fn acquire_channel(&self) -> Result<PooledChannel<C>, ConnectionHolderError> {
        let channels = self
            .pools
            .read()
            .as_ref()
            .map(|pools| pools.channels.clone())
            .ok_or(ConnectionHolderError::NotStarted)?;
        Ok(channels.acquire().await?)
    }

    /// Give a channel back to the pool.
    pub fn release_channel(&self, channel: PooledChannel<C>) {
        drop(channel);
    }

    /// `None` if the holder is not started.
    pub fn status(&self) -> Option<HolderStatus> {
        self.pools.read().as_ref().map(|pools| HolderStatus {
            connections: pools.connections.status(),
            channels: pools.channels.status(),
        })
    }
}

#[async_trait::async_trait]
impl<C: Connector + Clone> Service for ConnectionHolder<C> {
    fn name(&self) -> &str {
        "connection_holder"
    }

    async fn start(&self) -> Result<(), anyhow::Error> {
        Ok(ConnectionHolder::start(self)?)
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        ConnectionHolder::stop(self).await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        ConnectionHolder::health_check(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;

    fn holder(connections: usize, channels: usize) -> (ConnectionHolder<MemoryBroker>, MemoryBroker) {
        let broker = MemoryBroker::new();
        let holder = ConnectionHolder::new(
            broker.clone(),
            PoolSizes {
                connections,
                channels,
                drain_timeout: Duration::from_secs(1),
            },
        );
        (holder, broker)
    }

    #[tokio::test]
    async fn acquiring_a_channel_before_start_fails() {
        let (holder, _) = holder(1, 1);

        let result = holder.acquire_channel().await;

        assert!(matches!(result, Err(ConnectionHolderError::NotStarted)));
        assert!(!holder.health_check().await);
    }

    #[tokio::test]
    async fn channels_only_borrow_a_connection_while_being_created() {
        // Arrange
        let (holder, broker) = holder(1, 3);
        holder.start().unwrap();

        // Act
        let mut channels = Vec::new();
        for _ in 0..3 {
            channels.push(holder.acquire_channel().await.unwrap());
        }

        // Assert
        let status = holder.status().unwrap();
        assert_eq!(status.channels.outstanding, 3);
        assert_eq!(status.connections.outstanding, 0);
        assert_eq!(status.connections.idle, 1);
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(broker.open_channels(), 3);
    }

    #[tokio::test]
    async fn stop_closes_channels_then_connections() {
        let (holder, broker) = holder(2, 2);
        holder.start().unwrap();
        let channel = holder.acquire_channel().await.unwrap();
        holder.release_channel(channel);

        holder.stop().await;

        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.open_connections(), 0);
        assert!(holder.status().is_none());
        assert!(matches!(
            holder.acquire_channel().await,
            Err(ConnectionHolderError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn the_health_check_reports_an_unreachable_broker() {
        let (holder, broker) = holder(1, 1);
        holder.start().unwrap();
        assert!(holder.health_check().await);

        holder.stop().await;
        broker.set_unavailable(true);
        holder.start().unwrap();

        assert!(!holder.health_check().await);
    }

    #[tokio::test]
    async fn broken_channels_are_replaced() {
        let (holder, broker) = holder(1, 1);
        holder.start().unwrap();
        let channel = holder.acquire_channel().await.unwrap();
        channel.close().await.unwrap();
        holder.release_channel(channel);

        let channel = holder.acquire_channel().await.unwrap();

        assert!(!channel.is_closed());
        assert_eq!(broker.open_channels(), 1);
    }

    #[test]
    fn pool_sizes_follow_the_settings() {
        let settings = RabbitMqSettings {
            connection_pool_size: 3,
            channel_pool_size: 30,
            ..RabbitMqSettings::default()
        };

        let sizes = PoolSizes::from(&settings);

        assert_eq!(sizes.connections, 3);
        assert_eq!(sizes.channels, 30);
    }
}
