use std::sync::Arc;

use redis::aio::{ConnectionManager, MultiplexedConnection};

use crate::config::Config;
use crate::error::Result;

/// Pool-backed handle to the Redis endpoint.
///
/// Everyday commands share one auto-reconnecting [`ConnectionManager`];
/// WATCH/MULTI/EXEC sequences get a dedicated short-lived connection so their
/// transaction state never leaks into unrelated commands.
#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    manager: Arc<tokio::sync::OnceCell<ConnectionManager>>,
}

impl RedisConnector {
    pub fn new(config: &Config) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())?;
        Ok(Self {
            client,
            manager: Arc::new(tokio::sync::OnceCell::new()),
        })
    }

    /// Cheap clone of the shared manager, created lazily on first use.
    pub async fn conn(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(manager.clone())
    }

    /// A fresh standalone connection, for blocking pops and transactions.
    pub async fn dedicated_conn(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
