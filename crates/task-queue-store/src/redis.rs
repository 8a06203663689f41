use crate::store::{AutoClaim, KeyTtl, LogEntry, ScoredMember, Store, Transaction, WriteOp};
use crate::{Result, StoreConfig, StoreError};
use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use ::redis::{Client, RedisError, Value};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling interval used to emulate a blocking group read
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`Store`] backed by a Redis server.
///
/// Plain commands share one multiplexed connection. Each transaction opens a
/// dedicated connection so its `WATCH` is not disturbed by other callers.
/// Blocking group reads poll with a zero-wait `XREADGROUP` instead of
/// `BLOCK`, which would stall every other request pipelined on the shared
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.url()).await
    }

    /// Connects using a `redis://[:<password>@]<host>:<port>[/<db>]` URL
    pub async fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected to Redis");
        Ok(RedisStore { client, conn })
    }

    async fn dedicated(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        id: &str,
    ) -> Result<Vec<LogEntry>> {
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if count > 0 {
            cmd.arg("COUNT").arg(count);
        }
        cmd.arg("STREAMS").arg(key).arg(id);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| classify(e, key, group))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|stream| stream.ids)
                    .map(to_log_entry)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn classify(err: RedisError, key: &str, group: &str) -> StoreError {
    match err.code() {
        Some("NOGROUP") => StoreError::NoGroup {
            key: key.to_string(),
            group: group.to_string(),
        },
        Some("WRONGTYPE") => StoreError::WrongType(key.to_string()),
        _ => StoreError::Redis(err),
    }
}

fn key_error(err: RedisError, key: &str) -> StoreError {
    match err.code() {
        Some("WRONGTYPE") => StoreError::WrongType(key.to_string()),
        _ => StoreError::Redis(err),
    }
}

/// Score bound as Redis expects it, with infinities spelled out
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

fn to_log_entry(id: StreamId) -> LogEntry {
    let fields = id
        .map
        .keys()
        .filter_map(|name| id.get::<String>(name).map(|value| (name.clone(), value)))
        .collect();
    LogEntry {
        id: id.id.clone(),
        fields,
    }
}

fn to_scored(pairs: Vec<(String, f64)>) -> Vec<ScoredMember> {
    pairs
        .into_iter()
        .map(|(member, score)| ScoredMember { member, score })
        .collect()
}

async fn range_by_score(
    conn: &mut MultiplexedConnection,
    key: &str,
    min: f64,
    max: f64,
) -> Result<Vec<ScoredMember>> {
    let pairs: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
        .arg(key)
        .arg(score_arg(min))
        .arg(score_arg(max))
        .arg("WITHSCORES")
        .query_async(conn)
        .await
        .map_err(|e| key_error(e, key))?;
    Ok(to_scored(pairs))
}

#[async_trait]
impl Store for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let added: i64 = ::redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))?;
        Ok(added > 0)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>> {
        range_by_score(&mut self.conn.clone(), key, min, max).await
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ScoredMember>> {
        let pairs: Vec<(String, f64)> = ::redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))?;
        Ok(to_scored(pairs))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = ::redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        ::redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))
    }

    async fn xgroup_create(&self, key: &str, group: &str) -> Result<bool> {
        let created: std::result::Result<(), RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(classify(e, key, group)),
        }
    }

    async fn xadd(&self, key: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        cmd.query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))
    }

    async fn xread_group_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let entries = self.read_group(key, group, consumer, count, ">").await?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }
            tokio::time::sleep(READ_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    async fn xread_group_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<LogEntry>> {
        self.read_group(key, group, consumer, 0, "0").await
    }

    async fn xautoclaim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim> {
        let reply: StreamAutoClaimReply = ::redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| classify(e, key, group))?;

        Ok(AutoClaim {
            next: reply.next_stream_id,
            claimed: reply.claimed.into_iter().map(to_log_entry).collect(),
        })
    }

    async fn xack(&self, key: &str, group: &str, ids: &[&str]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        ::redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(ids)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| classify(e, key, group))
    }

    async fn xlen(&self, key: &str) -> Result<usize> {
        ::redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Value = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| key_error(e, key))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let pttl: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(match pttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(set == 1)
    }

    async fn watch(&self, keys: &[&str]) -> Result<Box<dyn Transaction>> {
        let mut conn = self.dedicated().await?;
        let () = ::redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        Ok(Box::new(RedisTransaction { conn }))
    }
}

struct RedisTransaction {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| key_error(e, key))
    }

    async fn zrange_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>> {
        range_by_score(&mut self.conn, key, min, max).await
    }

    async fn exec(mut self: Box<Self>, ops: Vec<WriteOp>) -> Result<()> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                WriteOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                WriteOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                WriteOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        // EXEC replies nil when a watched key changed
        let committed: Option<()> = pipe.query_async(&mut self.conn).await?;
        committed.ok_or(StoreError::Conflict)
    }

    async fn discard(mut self: Box<Self>) -> Result<()> {
        let () = ::redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg_spells_infinities() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1500.0), "1500");
        assert_eq!(score_arg(0.25), "0.25");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
