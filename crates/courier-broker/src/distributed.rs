use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};

use crate::{Broker, BrokerConfig, BrokerError, BrokerMode, FanoutMessage, FanoutStream};

/// Set-if-absent, or succeed without touching the expiry when the caller
/// already holds the key.
const ACQUIRE_LEASE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if current == ARGV[1] then
  return 1
end
return 0
"#;

/// Redis-backed broker.
///
/// Leases are plain string keys with a millisecond expiry. Expiring sets are
/// sorted sets scored by each member's expiry in epoch milliseconds; counting
/// prunes and reads in one `MULTI` block.
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    acquire: Script,
    op_timeout: Duration,
}

impl RedisBroker {
    /// Open a managed connection and verify it answers `PING`.
    pub async fn connect(url: &str, config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = match tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client.clone())).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(BrokerError::Timeout {
                    op: "connect",
                    after: config.connect_timeout(),
                })
            }
        };

        let broker = Self {
            client,
            conn,
            acquire: Script::new(ACQUIRE_LEASE),
            op_timeout: config.op_timeout(),
        };
        broker.ping().await?;
        Ok(broker)
    }

    /// Run one broker call under the operation timeout.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Timeout {
                op,
                after: self.op_timeout,
            }),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl Broker for RedisBroker {
    fn mode(&self) -> BrokerMode {
        BrokerMode::Distributed
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _pong: String = self
            .bounded("ping", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = self
            .bounded("publish", async move {
                redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload.as_ref())
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<FanoutStream, BrokerError> {
        let client = self.client.clone();
        let pubsub = self
            .bounded("subscribe", async move {
                let mut pubsub = client.get_async_pubsub().await?;
                for channel in channels {
                    pubsub.subscribe(channel.as_str()).await?;
                }
                Ok::<_, redis::RedisError>(pubsub)
            })
            .await?;

        let stream = pubsub.into_on_message().map(|msg| FanoutMessage {
            channel: msg.get_channel_name().to_owned(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(Box::pin(stream))
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.acquire.key(key);
        invocation.arg(holder).arg(ttl_millis(ttl));
        let granted: i64 = self
            .bounded("acquire_lease", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(granted == 1)
    }

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _deleted: i64 = self
            .bounded("release_lease", async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        self.bounded("lease_holder", async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn touch_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let expires_at = now_millis().saturating_add(i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX));
        // The whole set expires with its newest member.
        let _: () = self
            .bounded("touch_member", async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZADD")
                    .arg(key)
                    .arg(expires_at)
                    .arg(member)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = self
            .bounded("remove_member", async move {
                redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn live_members(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let now = now_millis();
        let (count,): (u64,) = self
            .bounded("live_members", async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(now)
                    .ignore()
                    .cmd("ZCARD")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }
}
