//! Read-only inspection of a queue, shared by the `tq-admin` commands.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use task_queue_core::store::Store;
use task_queue_core::{QueueKeys, Result, StoreContext, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_id: String,
    pub ready: usize,
    pub delayed: usize,
    pub log: usize,
}

pub async fn queue_stats(store: &dyn Store, keys: &QueueKeys) -> Result<QueueStats> {
    Ok(QueueStats {
        queue_id: keys.queue_id.clone(),
        ready: store.zcard(&keys.ready).await.context(|| format!("sizing {}", keys.ready))?,
        delayed: store
            .zcard(&keys.delayed)
            .await
            .context(|| format!("sizing {}", keys.delayed))?,
        log: store.xlen(&keys.log).await.context(|| format!("sizing {}", keys.log))?,
    })
}

/// One member of an ordered set as shown by `peek`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeekedTask {
    pub score: f64,
    /// Due time of a delayed member
    pub due: Option<DateTime<Utc>>,
    /// `None` when the member does not decode as a task
    pub task: Option<Task>,
    pub raw: String,
}

/// The first `limit` members of the ready set, or of the delayed set when
/// `delayed` is set, in the order the broker would take them.
pub async fn peek(
    store: &dyn Store,
    keys: &QueueKeys,
    delayed: bool,
    limit: usize,
) -> Result<Vec<PeekedTask>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let key = if delayed { &keys.delayed } else { &keys.ready };
    let members = store
        .zrange(key, 0, limit as isize - 1)
        .await
        .context(|| format!("reading {}", key))?;

    Ok(members
        .into_iter()
        .map(|scored| PeekedTask {
            score: scored.score,
            due: if delayed {
                Utc.timestamp_millis_opt(scored.score as i64).single()
            } else {
                None
            },
            task: Task::decode(&scored.member).ok(),
            raw: scored.member,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue_core::store::MemoryStore;
    use task_queue_core::Payload;

    #[tokio::test]
    async fn test_stats_of_fresh_queue() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("jobs");

        let stats = queue_stats(&store, &keys).await.unwrap();
        assert_eq!(
            stats,
            QueueStats { queue_id: "jobs".to_string(), ready: 0, delayed: 0, log: 0 }
        );
    }

    #[tokio::test]
    async fn test_stats_and_peek() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("jobs");
        for (id, priority) in [("low", 9.0), ("high", 1.0), ("mid", 5.0)] {
            let task = Task::new(id, priority, Payload::default());
            store.zadd(&keys.ready, &task.encode().unwrap(), priority).await.unwrap();
        }
        store.zadd(&keys.ready, "not json", 7.0).await.unwrap();
        store.zadd(&keys.delayed, "{}", 1_700_000_000_000.0).await.unwrap();
        store.xadd(&keys.log, &[("task", "{}")]).await.unwrap();

        let stats = queue_stats(&store, &keys).await.unwrap();
        assert_eq!((stats.ready, stats.delayed, stats.log), (4, 1, 1));

        let ready = peek(&store, &keys, false, 3).await.unwrap();
        let ids: Vec<_> = ready
            .iter()
            .map(|p| p.task.as_ref().map(|t| t.id.as_str()))
            .collect();
        assert_eq!(ids, vec![Some("high"), Some("mid"), None]);
        assert_eq!(ready[2].raw, "not json");
        assert_eq!(ready[2].due, None);

        let delayed = peek(&store, &keys, true, 10).await.unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].due.unwrap().timestamp_millis(), 1_700_000_000_000);

        assert!(peek(&store, &keys, false, 0).await.unwrap().is_empty());
    }
}
