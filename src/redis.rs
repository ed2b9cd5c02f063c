//! Redis-backed event store speaking the Upstash REST protocol.
//!
//! Key layout:
//! - `<prefix>:wf:<workflowID>:events` — list of JSON event records,
//!   list index = sequence - 1
//! - `<prefix>:wf:index` — set of active workflow ids
//!
//! The append CAS runs server-side as an `EVAL` script that checks
//! the tail length before pushing, so no client-side locking is ever
//! involved. The REST protocol has no push channel; subscriptions are
//! served by a background poller that diffs tails and republishes
//! into a local broadcast hub.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::StoreError;
use crate::events::{EventKind, EventRecord};
use crate::store::{EventFilter, EventStore, EventSubscription};
use crate::types::{Sequence, WorkflowId};

/// Server-side CAS: append iff the tail equals the expected sequence.
/// Returns the new tail on success, `-1 - actual` on conflict.
const CAS_APPEND_SCRIPT: &str = r#"
local tail = redis.call('LLEN', KEYS[1])
if tail == tonumber(ARGV[1]) then
  redis.call('RPUSH', KEYS[1], ARGV[2])
  redis.call('SADD', KEYS[2], ARGV[3])
  return tail + 1
end
return -1 - tail
"#;

/// Restore an archived aggregate only if it is absent.
const RESTORE_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) > 0 then
  return -1
end
for i = 2, #ARGV do
  redis.call('RPUSH', KEYS[1], ARGV[i])
end
redis.call('SADD', KEYS[2], ARGV[1])
return #ARGV - 1
"#;

/// Response envelope of the Upstash REST API.
#[derive(Debug, Deserialize)]
struct RedisResponse {
    result: Value,
}

pub mod keys {
    /// Event list of one workflow aggregate.
    pub fn events(prefix: &str, workflow_id: &str) -> String {
        format!("{prefix}:wf:{workflow_id}:events")
    }

    /// Set of active workflow ids.
    pub fn index(prefix: &str) -> String {
        format!("{prefix}:wf:index")
    }
}

/// Event store backed by a Redis REST endpoint.
pub struct RedisEventStore {
    http: reqwest::Client,
    url: String,
    token: String,
    prefix: String,
    tx: broadcast::Sender<EventRecord>,
}

impl RedisEventStore {
    /// Build the store and start the subscription poller.
    pub fn new(
        http: reqwest::Client,
        url: String,
        token: String,
        prefix: String,
        subscription_buffer: usize,
        poll_interval: Duration,
    ) -> std::sync::Arc<Self> {
        let (tx, _) = broadcast::channel(subscription_buffer.max(1));
        let store = std::sync::Arc::new(Self {
            http,
            url,
            token,
            prefix,
            tx,
        });
        tokio::spawn(poll_loop(store.clone(), poll_interval));
        store
    }

    /// Execute one Redis command via the REST API, with a short
    /// jittered retry on transport failures.
    async fn execute(&self, command: Vec<Value>) -> Result<Value, StoreError> {
        let mut last_err = String::new();
        for attempt in 0..3u32 {
            if attempt > 0 {
                let base = 50u64 << attempt;
                let jitter = rand::thread_rng().gen_range(0..base);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            let sent = self
                .http
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.token))
                .json(&command)
                .send()
                .await;
            match sent {
                Ok(response) => {
                    let parsed: RedisResponse = response
                        .json()
                        .await
                        .map_err(|e| StoreError::Backend(format!("bad redis response: {e}")))?;
                    return Ok(parsed.result);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(StoreError::Backend(format!("redis unreachable: {last_err}")))
    }

    fn decode_records(&self, raw: Value) -> Result<Vec<EventRecord>, StoreError> {
        let Value::Array(items) = raw else {
            return Ok(Vec::new());
        };
        items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .map(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| StoreError::Backend(format!("corrupt event record: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn append(
        &self,
        workflow_id: &str,
        expected: Sequence,
        kind: EventKind,
    ) -> Result<EventRecord, StoreError> {
        let record = EventRecord {
            workflow_id: workflow_id.to_string(),
            sequence: expected + 1,
            timestamp: Utc::now(),
            kind,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| StoreError::Backend(format!("unserializable event: {e}")))?;

        let result = self
            .execute(vec![
                json!("EVAL"),
                json!(CAS_APPEND_SCRIPT),
                json!("2"),
                json!(keys::events(&self.prefix, workflow_id)),
                json!(keys::index(&self.prefix)),
                json!(expected.to_string()),
                json!(payload),
                json!(workflow_id),
            ])
            .await?;

        match result.as_i64() {
            Some(tail) if tail >= 0 => {
                let _ = self.tx.send(record.clone());
                Ok(record)
            }
            Some(encoded) => Err(StoreError::Conflict {
                expected,
                actual: (-1 - encoded) as Sequence,
            }),
            None => Err(StoreError::Backend(format!(
                "unexpected EVAL result: {result}"
            ))),
        }
    }

    async fn read(&self, workflow_id: &str, from: Sequence) -> Result<Vec<EventRecord>, StoreError> {
        let start = from.max(1) - 1;
        let raw = self
            .execute(vec![
                json!("LRANGE"),
                json!(keys::events(&self.prefix, workflow_id)),
                json!(start.to_string()),
                json!("-1"),
            ])
            .await?;
        self.decode_records(raw)
    }

    async fn tail(&self, workflow_id: &str) -> Result<Sequence, StoreError> {
        let raw = self
            .execute(vec![
                json!("LLEN"),
                json!(keys::events(&self.prefix, workflow_id)),
            ])
            .await?;
        Ok(raw.as_u64().unwrap_or(0))
    }

    fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription::new(self.tx.subscribe(), filter)
    }

    async fn index(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let raw = self
            .execute(vec![json!("SMEMBERS"), json!(keys::index(&self.prefix))])
            .await?;
        let Value::Array(items) = raw else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<WorkflowId> = items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_aggregate(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.execute(vec![
            json!("DEL"),
            json!(keys::events(&self.prefix, workflow_id)),
        ])
        .await?;
        self.execute(vec![
            json!("SREM"),
            json!(keys::index(&self.prefix)),
            json!(workflow_id),
        ])
        .await?;
        Ok(())
    }

    async fn restore_aggregate(
        &self,
        workflow_id: &str,
        events: Vec<EventRecord>,
    ) -> Result<(), StoreError> {
        let mut command = vec![
            json!("EVAL"),
            json!(RESTORE_SCRIPT),
            json!("2"),
            json!(keys::events(&self.prefix, workflow_id)),
            json!(keys::index(&self.prefix)),
            json!(workflow_id),
        ];
        for record in &events {
            let payload = serde_json::to_string(record)
                .map_err(|e| StoreError::Backend(format!("unserializable event: {e}")))?;
            command.push(json!(payload));
        }
        let result = self.execute(command).await?;
        match result.as_i64() {
            Some(n) if n >= 0 => Ok(()),
            _ => Err(StoreError::Conflict {
                expected: 0,
                actual: self.tail(workflow_id).await.unwrap_or(1),
            }),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let raw = self.execute(vec![json!("PING")]).await?;
        match raw.as_str() {
            Some("PONG") => Ok(()),
            _ => Err(StoreError::Backend(format!("unexpected PING reply: {raw}"))),
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Tail-diffing poller feeding the local subscription hub with events
/// appended by other replicas.
async fn poll_loop(store: std::sync::Arc<RedisEventStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seen: HashMap<WorkflowId, Sequence> = HashMap::new();

    loop {
        ticker.tick().await;
        if store.tx.receiver_count() == 0 {
            continue;
        }

        let ids = match store.index().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("subscription poller cannot read index: {e}");
                continue;
            }
        };

        for id in ids {
            let last = seen.get(&id).copied().unwrap_or(0);
            let records = match store.read(&id, last + 1).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(workflow_id = %id, "subscription poller read failed: {e}");
                    continue;
                }
            };
            for record in records {
                // Locally appended events were already published at
                // append time, so this can duplicate them; delivery is
                // at-least-once and subscribers key on sequence.
                seen.insert(id.clone(), record.sequence);
                let _ = store.tx.send(record);
            }
        }
    }
}
