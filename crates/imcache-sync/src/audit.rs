use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use imcache_core::{AuditEntry, AuditLevel, NewAuditEntry};
use imcache_storage::Store;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::SyncError;

/// Append-only run log backed by the store. Appends are best-effort: a
/// failing store is reported through tracing and never fails the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        level: AuditLevel,
        message: impl Into<String>,
        details: Option<JsonValue>,
    ) -> Option<AuditEntry> {
        let entry = NewAuditEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            details,
        };
        match self.store.append_audit(entry).await {
            Ok(stored) => Some(stored),
            Err(err) => {
                warn!(%err, "audit append failed");
                None
            }
        }
    }

    pub async fn query(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, SyncError> {
        Ok(self.store.recent_audit(limit, since).await?)
    }

    /// Deletes entries older than `older_than`. A negative window or one
    /// reaching before the representable calendar is rejected.
    pub async fn purge(&self, older_than: Duration) -> Result<u64, SyncError> {
        if older_than < Duration::zero() {
            return Err(SyncError::Validation(format!(
                "retention window must not be negative, got {} days",
                older_than.num_days()
            )));
        }
        let cutoff = Utc::now().checked_sub_signed(older_than).ok_or_else(|| {
            SyncError::Validation(format!(
                "retention window of {} days is out of range",
                older_than.num_days()
            ))
        })?;
        self.purge_before(cutoff).await
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, SyncError> {
        let purged = self.store.purge_audit_before(cutoff).await?;
        info!(purged, %cutoff, "purged audit entries");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imcache_storage::MemoryStore;

    #[tokio::test]
    async fn entries_come_back_newest_first() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        log.append(AuditLevel::Info, "first", None).await.unwrap();
        log.append(AuditLevel::Error, "second", Some(serde_json::json!({"date": "2025-03-09"})))
            .await
            .unwrap();

        let entries = log.query(10, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
        assert_eq!(entries[0].level, AuditLevel::Error);
        assert_eq!(entries[0].details.as_ref().unwrap()["date"], "2025-03-09");
        assert_eq!(log.query(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_keeps_recent_entries() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        log.append(AuditLevel::Success, "fresh", None).await.unwrap();
        assert_eq!(log.purge(Duration::days(7)).await.unwrap(), 0);
        assert_eq!(log.query(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn negative_windows_are_rejected_without_deleting() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        log.append(AuditLevel::Success, "fresh", None).await.unwrap();

        let err = log.purge(Duration::days(-1)).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(log.query(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn windows_past_the_calendar_are_rejected() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        log.append(AuditLevel::Info, "kept", None).await.unwrap();

        let err = log.purge(Duration::days(100_000_000)).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(log.query(10, None).await.unwrap().len(), 1);
    }
}
