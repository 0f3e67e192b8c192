//! In-process job store

use std::collections::HashMap;

use async_trait::async_trait;
use labdash_shared::JobRecord;
use tokio::sync::RwLock;

use super::{abandon, Claim, JobStore};
use crate::error::StoreError;

/// Job store kept in memory; lost on restart
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn claim(&self, record: &JobRecord, now_ms: u64) -> Result<Claim, StoreError> {
        let mut records = self.records.write().await;
        match records.get(&record.id) {
            Some(current) if !current.is_claimable_at(now_ms) => Ok(Claim::Held(current.clone())),
            _ => {
                records.insert(record.id.clone(), record.clone());
                Ok(Claim::Acquired)
            }
        }
    }

    async fn update_owned(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(current) if !current.is_terminal() && current.owner == record.owner => {
                *current = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_leases(
        &self,
        owner: &str,
        ids: &[String],
        until_ms: u64,
    ) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let mut renewed = 0;
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                if !record.is_terminal() && record.owner.as_deref() == Some(owner) {
                    record.lease_until_ms = Some(until_ms);
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<Vec<String>, StoreError> {
        let mut records = self.records.write().await;
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.is_expired_at(now_ms))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            records.remove(id);
        }

        Ok(expired)
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut all: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn recover_abandoned(&self, now_ms: u64) -> Result<Vec<String>, StoreError> {
        let mut records = self.records.write().await;
        let mut recovered: Vec<String> = records
            .values_mut()
            .filter_map(|r| abandon(r, now_ms).then(|| r.id.clone()))
            .collect();
        recovered.sort();
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labdash_shared::{JobErrorKind, JobOutput, JobStatus, StatusRecord};
    use std::time::Duration;

    fn finished(id: &str, finished_at: u64, ttl_ms: u64) -> JobRecord {
        let mut rec = JobRecord::queued(id, Duration::from_millis(ttl_ms), Duration::from_secs(1));
        rec.complete(Ok(JobOutput::Status(StatusRecord::not_found("h"))), finished_at);
        rec
    }

    fn leased(id: &str, owner: &str, until: u64) -> JobRecord {
        JobRecord::queued(id, Duration::from_secs(60), Duration::from_secs(1)).leased_to(owner, until)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryJobStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.put(&finished("a", 10, 100)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().status(), JobStatus::Finished);
        assert_eq!(store.len().await, 1);

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let store = MemoryJobStore::new();
        store.put(&finished("old", 10, 100)).await.unwrap();
        store.put(&finished("fresh", 1_000, 100)).await.unwrap();
        store
            .put(&JobRecord::queued("queued", Duration::from_millis(1), Duration::from_secs(1)))
            .await
            .unwrap();

        let purged = store.purge_expired(500).await.unwrap();
        assert_eq!(purged, vec!["old".to_string()]);

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["fresh".to_string(), "queued".to_string()]);
    }

    #[tokio::test]
    async fn test_recover_abandoned() {
        let store = MemoryJobStore::new();
        store
            .put(&JobRecord::queued("stuck", Duration::from_secs(60), Duration::from_secs(1)))
            .await
            .unwrap();
        store.put(&finished("done", 10, 60_000)).await.unwrap();

        let recovered = store.recover_abandoned(50).await.unwrap();
        assert_eq!(recovered, vec!["stuck".to_string()]);

        let stuck = store.get("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status(), JobStatus::Failed);
        assert_eq!(stuck.error().map(|e| e.kind), Some(JobErrorKind::Abandoned));
    }

    #[tokio::test]
    async fn test_recover_skips_renewed_leases() {
        let store = MemoryJobStore::new();
        store.put(&leased("dev2_reset", "a", 1_000)).await.unwrap();
        store.put(&leased("dev1_reset", "b", 100)).await.unwrap();

        assert_eq!(store.recover_abandoned(500).await.unwrap(), vec!["dev1_reset".to_string()]);
        assert_eq!(
            store.get("dev2_reset").await.unwrap().unwrap().status(),
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_claim_respects_live_and_cached_records() {
        let store = MemoryJobStore::new();
        assert_eq!(store.claim(&leased("x", "a", 1_000), 0).await.unwrap(), Claim::Acquired);

        // Live and leased: the second claimant sees the holder's record
        match store.claim(&leased("x", "b", 2_000), 500).await.unwrap() {
            Claim::Held(current) => assert_eq!(current.owner.as_deref(), Some("a")),
            other => panic!("expected held, got {:?}", other),
        }

        // Lease lapsed: taken over
        assert_eq!(store.claim(&leased("x", "b", 3_000), 1_500).await.unwrap(), Claim::Acquired);

        store.put(&finished("y", 1_000, 100)).await.unwrap();
        assert!(matches!(store.claim(&leased("y", "a", 0), 1_050).await.unwrap(), Claim::Held(_)));
        assert_eq!(store.claim(&leased("y", "a", 0), 1_100).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn test_update_owned_refuses_other_owner_and_terminal() {
        let store = MemoryJobStore::new();
        store.put(&leased("x", "b", 1_000)).await.unwrap();

        let mut mine = leased("x", "a", 1_000);
        assert!(mine.mark_running(5));
        assert!(!store.update_owned(&mine).await.unwrap());

        let mut theirs = store.get("x").await.unwrap().unwrap();
        theirs.complete(Ok(JobOutput::Status(StatusRecord::not_found("h"))), 10);
        assert!(store.update_owned(&theirs).await.unwrap());
        // Terminal now; nothing overwrites it
        assert!(!store.update_owned(&theirs).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_leases_only_for_owner() {
        let store = MemoryJobStore::new();
        store.put(&leased("x", "a", 100)).await.unwrap();
        store.put(&leased("y", "b", 100)).await.unwrap();

        let ids = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        assert_eq!(store.renew_leases("a", &ids, 900).await.unwrap(), 1);
        assert_eq!(store.get("x").await.unwrap().unwrap().lease_until_ms, Some(900));
        assert_eq!(store.get("y").await.unwrap().unwrap().lease_until_ms, Some(100));
    }
}
