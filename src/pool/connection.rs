//! Implements [`Manager`] for the connections opened by a [`Connector`].

use super::resource_pool::{Manager, ResourcePool};
use crate::transport::{Connection, Connector};

/// `ConnectionPool` pools the connections opened by a [`Connector`].
pub type ConnectionPool<C> = ResourcePool<ConnectionManager<C>>;

/// `ConnectionManager` implements [`Manager`] for the connections opened by a [`Connector`].
pub struct ConnectionManager<C> {
    connector: C,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

#[async_trait::async_trait]
impl<C: Connector> Manager for ConnectionManager<C> {
    type Resource = C::Connection;

    async fn create(&self) -> Result<C::Connection, super::Error> {
        Ok(self.connector.connect().await?)
    }

    async fn recycle(&self, connection: &mut C::Connection) -> Result<(), super::Error> {
        if connection.is_closed() {
            return Err(anyhow::anyhow!("Connection is not in an healthy state").into());
        }
        Ok(())
    }

    async fn close(&self, connection: C::Connection) -> Result<(), super::Error> {
        Ok(connection.close().await?)
    }
}
