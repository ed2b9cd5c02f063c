//! Cold-workflow archival.
//!
//! Terminal workflows past the age threshold are moved out of the
//! event store into blob storage. A missing aggregate with an archive
//! entry is "hibernated": reads are declined until explicit
//! rehydration restores the log.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::events::EventRecord;
use crate::types::WorkflowId;

/// Blob-storage seam for archived event logs.
#[async_trait]
pub trait BlobArchive: Send + Sync {
    /// Store the full event log of a workflow.
    async fn archive(
        &self,
        workflow_id: &str,
        events: Vec<EventRecord>,
    ) -> Result<(), StoreError>;

    /// Remove and return an archived log, if present.
    async fn restore(&self, workflow_id: &str) -> Result<Option<Vec<EventRecord>>, StoreError>;

    async fn contains(&self, workflow_id: &str) -> Result<bool, StoreError>;
}

/// In-process archive; the default when no blob backend is wired up.
#[derive(Default)]
pub struct MemoryBlobArchive {
    inner: RwLock<HashMap<WorkflowId, Vec<EventRecord>>>,
}

#[async_trait]
impl BlobArchive for MemoryBlobArchive {
    async fn archive(
        &self,
        workflow_id: &str,
        events: Vec<EventRecord>,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .insert(workflow_id.to_string(), events);
        Ok(())
    }

    async fn restore(&self, workflow_id: &str) -> Result<Option<Vec<EventRecord>>, StoreError> {
        Ok(self.inner.write().await.remove(workflow_id))
    }

    async fn contains(&self, workflow_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.contains_key(workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use chrono::Utc;

    #[tokio::test]
    async fn archive_restore_round_trip_removes_the_entry() {
        let archive = MemoryBlobArchive::default();
        let events = vec![EventRecord {
            workflow_id: "wf".into(),
            sequence: 1,
            timestamp: Utc::now(),
            kind: EventKind::StepScheduled {
                step_id: "s".into(),
                attempt: 1,
            },
        }];

        archive.archive("wf", events.clone()).await.unwrap();
        assert!(archive.contains("wf").await.unwrap());

        let restored = archive.restore("wf").await.unwrap().unwrap();
        assert_eq!(restored, events);
        assert!(!archive.contains("wf").await.unwrap());
        assert!(archive.restore("wf").await.unwrap().is_none());
    }
}
