//! Redis store client

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError};
use async_trait::async_trait;

use super::{KeyValueStore, StoreError};
use crate::config::StoreConfig;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Redis client over a managed async connection
///
/// The connection is opened once in [`RedisStore::connect`]; the manager
/// re-dials on the next command after a drop, so loop-level retries see
/// the store come back without rebuilding the client.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    endpoint: String,
}

impl RedisStore {
    /// Open the connection
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(config.connection_url())?;
        let connection = ConnectionManager::new(client).await?;
        let endpoint = config.endpoint().to_string();

        tracing::info!(endpoint = %endpoint, "Connected to store");
        Ok(Self { connection, endpoint })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply == "PONG")
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
