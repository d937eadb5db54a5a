use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use std::{future::Future, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::queue::{EventQueue, QueueError};

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        QueueError::Unavailable(error.to_string())
    }
}

/// Redis list backend: LPUSH to append, BRPOP to consume.
///
/// Pushes and reads share one multiplexed connection. BRPOP parks its connection
/// on the server until it returns, so blocking pops get a connection of their own.
/// Each is opened on first use and dropped after any failure so that the next
/// call reconnects.
pub struct RedisQueue {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    blocking_connection: Mutex<Option<MultiplexedConnection>>,
    /// Bound on connecting and on every non-blocking command.
    op_timeout: Duration,
}

impl RedisQueue {
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, QueueError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: Mutex::new(None),
            blocking_connection: Mutex::new(None),
            op_timeout,
        })
    }

    async fn connect(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
    ) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = slot.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }
        debug!("Connecting to Redis");
        let connection = tokio::time::timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| QueueError::Timeout(self.op_timeout))??;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Runs a command under `limit`, forgetting the connection in `slot` if it fails.
    async fn run<T, F>(
        &self,
        slot: &Mutex<Option<MultiplexedConnection>>,
        limit: Duration,
        command: F,
    ) -> Result<T, QueueError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = match tokio::time::timeout(limit, command).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => QueueError::from(error),
            Err(_) => QueueError::Timeout(limit),
        };
        warn!("Redis command failed, dropping connection: {result}");
        *slot.lock().await = None;
        Err(result)
    }
}

#[async_trait::async_trait]
impl EventQueue for RedisQueue {
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        let mut connection = self.connect(&self.connection).await?;
        let _: u64 = self
            .run(&self.connection, self.op_timeout, connection.lpush(queue, payload))
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut connection = self.connect(&self.blocking_connection).await?;
        // The server holds the reply for up to `timeout`, so the client-side bound adds slack.
        let reply: Option<(String, String)> = self
            .run(
                &self.blocking_connection,
                timeout + self.op_timeout,
                connection.brpop(queue, timeout.as_secs_f64()),
            )
            .await?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn len(&self, queue: &str) -> Result<u64, QueueError> {
        let mut connection = self.connect(&self.connection).await?;
        self.run(&self.connection, self.op_timeout, connection.llen(queue))
            .await
    }
}
