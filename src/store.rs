//! Append-only event log with optimistic concurrency.
//!
//! The store is the only shared mutable resource in the system: all
//! cross-replica coordination goes through `append`'s compare-and-set
//! and the subscription fan-out. An aggregate with no events has tail
//! 0; `NotFound` does not exist as a store condition.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::error::StoreError;
use crate::events::{EventKind, EventRecord};
use crate::types::{Sequence, WorkflowId};

// ═══════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════

/// Subscription filter: aggregate id prefix and/or event-type names.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub workflow_prefix: Option<String>,
    pub kinds: Option<HashSet<String>>,
}

impl EventFilter {
    /// Match every event of a single workflow aggregate.
    pub fn for_workflow(workflow_id: &str) -> Self {
        Self {
            workflow_prefix: Some(workflow_id.to_string()),
            kinds: None,
        }
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        if let Some(prefix) = &self.workflow_prefix {
            if !record.workflow_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(record.kind.name()) {
                return false;
            }
        }
        true
    }
}

/// A live event feed. Delivery is at-least-once in global append order
/// per subscriber; per-aggregate order always holds. The buffer is
/// bounded: on overflow the subscription closes and the caller must
/// fall back to polling `read`.
pub struct EventSubscription {
    rx: broadcast::Receiver<EventRecord>,
    filter: EventFilter,
}

impl EventSubscription {
    pub fn new(rx: broadcast::Receiver<EventRecord>, filter: EventFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching event, or `None` once the subscription is closed
    /// (store dropped, or this subscriber lagged past the buffer).
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) if self.filter.matches(&record) => return Some(record),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscription lagged, closing");
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store contract
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only, per-aggregate ordered event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append iff the current tail sequence equals
    /// `expected`. The stored record gets sequence `expected + 1`.
    async fn append(
        &self,
        workflow_id: &str,
        expected: Sequence,
        kind: EventKind,
    ) -> Result<EventRecord, StoreError>;

    /// Events with `sequence >= from`, in order. `from = 0` reads the
    /// whole aggregate.
    async fn read(&self, workflow_id: &str, from: Sequence) -> Result<Vec<EventRecord>, StoreError>;

    /// Current last sequence; 0 for an aggregate with no events.
    async fn tail(&self, workflow_id: &str) -> Result<Sequence, StoreError>;

    /// Lazy feed of every event appended after this call that matches
    /// `filter`.
    fn subscribe(&self, filter: EventFilter) -> EventSubscription;

    /// Workflow ids currently present in the index aggregate.
    async fn index(&self) -> Result<Vec<WorkflowId>, StoreError>;

    /// Drop an aggregate and its index entry (hibernation handoff).
    async fn delete_aggregate(&self, workflow_id: &str) -> Result<(), StoreError>;

    /// Reinstate a previously deleted aggregate from archived events.
    /// Fails if the aggregate is non-empty.
    async fn restore_aggregate(
        &self,
        workflow_id: &str,
        events: Vec<EventRecord>,
    ) -> Result<(), StoreError>;

    /// Backend liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local store. The CAS and subscription semantics are
/// identical to the Redis backend, which makes it the default for
/// single-replica deployments and for tests.
pub struct MemoryEventStore {
    aggregates: RwLock<HashMap<WorkflowId, Vec<EventRecord>>>,
    index: RwLock<BTreeSet<WorkflowId>>,
    tx: broadcast::Sender<EventRecord>,
}

impl MemoryEventStore {
    pub fn new(subscription_buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(subscription_buffer.max(1));
        Self {
            aggregates: RwLock::new(HashMap::new()),
            index: RwLock::new(BTreeSet::new()),
            tx,
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        workflow_id: &str,
        expected: Sequence,
        kind: EventKind,
    ) -> Result<EventRecord, StoreError> {
        let mut aggregates = self.aggregates.write().await;
        let log = aggregates.entry(workflow_id.to_string()).or_default();
        let actual = log.len() as Sequence;
        if actual != expected {
            return Err(StoreError::Conflict { expected, actual });
        }

        let record = EventRecord {
            workflow_id: workflow_id.to_string(),
            sequence: actual + 1,
            timestamp: Utc::now(),
            kind,
        };
        log.push(record.clone());

        self.index.write().await.insert(workflow_id.to_string());
        // Published under the aggregate lock so subscribers observe
        // per-aggregate order. No receivers is fine.
        let _ = self.tx.send(record.clone());
        Ok(record)
    }

    async fn read(&self, workflow_id: &str, from: Sequence) -> Result<Vec<EventRecord>, StoreError> {
        let aggregates = self.aggregates.read().await;
        let Some(log) = aggregates.get(workflow_id) else {
            return Ok(Vec::new());
        };
        let start = (from.max(1) - 1) as usize;
        Ok(log.get(start..).unwrap_or_default().to_vec())
    }

    async fn tail(&self, workflow_id: &str) -> Result<Sequence, StoreError> {
        let aggregates = self.aggregates.read().await;
        Ok(aggregates
            .get(workflow_id)
            .map(|log| log.len() as Sequence)
            .unwrap_or(0))
    }

    fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription::new(self.tx.subscribe(), filter)
    }

    async fn index(&self) -> Result<Vec<WorkflowId>, StoreError> {
        Ok(self.index.read().await.iter().cloned().collect())
    }

    async fn delete_aggregate(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.aggregates.write().await.remove(workflow_id);
        self.index.write().await.remove(workflow_id);
        Ok(())
    }

    async fn restore_aggregate(
        &self,
        workflow_id: &str,
        events: Vec<EventRecord>,
    ) -> Result<(), StoreError> {
        let mut aggregates = self.aggregates.write().await;
        let log = aggregates.entry(workflow_id.to_string()).or_default();
        if !log.is_empty() {
            return Err(StoreError::Conflict {
                expected: 0,
                actual: log.len() as Sequence,
            });
        }
        *log = events;
        drop(aggregates);
        self.index.write().await.insert(workflow_id.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn other_kind() -> EventKind {
        EventKind::WorkflowFailed {
            at: Utc::now(),
            error: "placeholder".into(),
        }
    }

    fn scheduled(step: &str, attempt: u32) -> EventKind {
        EventKind::StepScheduled {
            step_id: step.into(),
            attempt,
        }
    }

    #[tokio::test]
    async fn append_assigns_monotonic_sequences() {
        let store = MemoryEventStore::default();
        let a = store.append("wf", 0, scheduled("s", 1)).await.unwrap();
        let b = store.append("wf", 1, scheduled("s", 2)).await.unwrap();
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(store.tail("wf").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_sequence() {
        let store = MemoryEventStore::default();
        store.append("wf", 0, scheduled("s", 1)).await.unwrap();

        // Both "replicas" observed tail 1; only one append wins.
        store.append("wf", 1, scheduled("t", 1)).await.unwrap();
        let err = store.append("wf", 1, scheduled("u", 1)).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: 1, actual: 2 });
    }

    #[tokio::test]
    async fn empty_aggregate_has_tail_zero_and_empty_read() {
        let store = MemoryEventStore::default();
        assert_eq!(store.tail("nope").await.unwrap(), 0);
        assert!(store.read("nope", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_from_sequence_is_inclusive() {
        let store = MemoryEventStore::default();
        for i in 0..4 {
            store.append("wf", i, scheduled("s", i as u32 + 1)).await.unwrap();
        }
        let slice = store.read("wf", 3).await.unwrap();
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].sequence, 3);
        let all = store.read("wf", 0).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn subscription_filters_by_workflow_and_kind() {
        let store = MemoryEventStore::default();
        let mut sub = store.subscribe(EventFilter {
            workflow_prefix: Some("wf-a".into()),
            kinds: Some(HashSet::from(["StepScheduled".to_string()])),
        });

        store.append("wf-b", 0, scheduled("s", 1)).await.unwrap();
        store.append("wf-a", 0, other_kind()).await.unwrap();
        store.append("wf-a", 1, scheduled("s", 1)).await.unwrap();

        let got = sub.next().await.unwrap();
        assert_eq!(got.workflow_id, "wf-a");
        assert_eq!(got.kind.name(), "StepScheduled");
    }

    #[tokio::test]
    async fn restore_refuses_nonempty_aggregate() {
        let store = MemoryEventStore::default();
        let rec = store.append("wf", 0, scheduled("s", 1)).await.unwrap();
        let err = store
            .restore_aggregate("wf", vec![rec])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_clears_log_and_index() {
        let store = MemoryEventStore::default();
        store.append("wf", 0, scheduled("s", 1)).await.unwrap();
        assert_eq!(store.index().await.unwrap(), vec!["wf".to_string()]);

        store.delete_aggregate("wf").await.unwrap();
        assert!(store.index().await.unwrap().is_empty());
        assert_eq!(store.tail("wf").await.unwrap(), 0);
    }

    #[test]
    fn filter_prefix_semantics() {
        let record = EventRecord {
            workflow_id: "orders-17".into(),
            sequence: 1,
            timestamp: Utc::now(),
            kind: EventKind::WorkflowCompleted {
                at: Utc::now(),
                outputs: HashMap::new(),
            },
        };
        assert!(EventFilter::default().matches(&record));
        assert!(EventFilter {
            workflow_prefix: Some("orders-".into()),
            kinds: None
        }
        .matches(&record));
        assert!(!EventFilter {
            workflow_prefix: Some("billing-".into()),
            kinds: None
        }
        .matches(&record));
    }
}
