use std::sync::Arc;

use chrono::Utc;
use imcache_core::{CanonicalRecord, Outcome, ReconcileMode, UpdatePolicy};
use imcache_storage::Store;
use tracing::debug;

use crate::SyncError;

/// Decides and applies create/update/skip for one canonical record against
/// the row stored under the same natural key.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
}

enum Decision {
    Insert,
    Replace(i64),
    Skip,
}

fn decide(existing: Option<i64>, policy: UpdatePolicy, mode: ReconcileMode) -> Decision {
    match (existing, policy, mode) {
        (None, _, _) => Decision::Insert,
        (Some(id), UpdatePolicy::AlwaysRefresh, _) => Decision::Replace(id),
        (Some(id), UpdatePolicy::SkipUnlessForced, ReconcileMode::ForceOverwrite) => {
            Decision::Replace(id)
        }
        (Some(_), UpdatePolicy::SkipUnlessForced, ReconcileMode::SkipExisting) => Decision::Skip,
        (Some(_), UpdatePolicy::Immutable, _) => Decision::Skip,
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// A storage failure comes back as `SyncError::Persistence`; the caller
    /// counts it against this record only. A lost insert race surfaces the
    /// same way through the store's uniqueness constraint.
    pub async fn reconcile(
        &self,
        record: &CanonicalRecord,
        mode: ReconcileMode,
    ) -> Result<Outcome, SyncError> {
        let now = Utc::now();
        let policy = record.kind().update_policy();

        let outcome = match record {
            CanonicalRecord::DailyImage(draft) => {
                let existing = self.store.find_daily_image_by_date(draft.date).await?;
                match decide(existing.map(|r| r.id), policy, mode) {
                    Decision::Insert => {
                        self.store.insert_daily_image(draft, now).await?;
                        Outcome::Created
                    }
                    Decision::Replace(id) => {
                        self.store.replace_daily_image(id, draft, now).await?;
                        Outcome::Updated
                    }
                    Decision::Skip => Outcome::Skipped,
                }
            }
            CanonicalRecord::Layer(draft) => {
                let existing = self.store.find_layer(&draft.layer_id).await?;
                match decide(existing.map(|l| l.id), policy, mode) {
                    Decision::Insert => {
                        self.store.insert_layer(draft, now).await?;
                        Outcome::Created
                    }
                    Decision::Replace(id) => {
                        self.store.replace_layer(id, draft, now).await?;
                        Outcome::Updated
                    }
                    Decision::Skip => Outcome::Skipped,
                }
            }
            CanonicalRecord::Coordinate(draft) => {
                let existing = self.store.find_coordinate(&draft.name, &draft.body).await?;
                match decide(existing.map(|c| c.id), policy, mode) {
                    Decision::Insert => {
                        self.store.insert_coordinate(draft, now).await?;
                        Outcome::Created
                    }
                    // coordinates are never rewritten once seeded
                    Decision::Replace(_) | Decision::Skip => Outcome::Skipped,
                }
            }
        };

        debug!(key = %record.natural_key(), kind = %record.kind(), %outcome, "reconciled");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use imcache_core::{CoordinateDraft, DailyImageDraft, LayerDraft, TemporalResolution};
    use imcache_storage::MemoryStore;

    fn reconciler() -> (Reconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Reconciler::new(store.clone()), store)
    }

    fn daily(title: &str) -> CanonicalRecord {
        CanonicalRecord::DailyImage(DailyImageDraft {
            date: NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
            title: title.into(),
            explanation: format!("{title} explained"),
            url: "https://apod.example/a.jpg".into(),
            hd_url: Some("https://apod.example/a_hd.jpg".into()),
            media_type: "image".into(),
            copyright: None,
            thumbnail_url: None,
        })
    }

    fn layer(title: &str, description: &str) -> LayerDraft {
        LayerDraft {
            layer_id: "MODIS_Terra_Snow_Cover".into(),
            title: title.into(),
            subtitle: String::new(),
            description: description.into(),
            format: "png".into(),
            projection: "EPSG:4326".into(),
            start_date: NaiveDate::from_ymd_opt(2000, 2, 24),
            end_date: None,
            temporal_resolution: TemporalResolution::Daily,
            category: "Snow Cover".into(),
            tags: vec!["snow cover".into()],
            source: "NASA GIBS".into(),
            wraparound: true,
        }
    }

    #[test]
    fn decision_table_follows_entity_policy() {
        use ReconcileMode::*;
        assert!(matches!(decide(None, UpdatePolicy::Immutable, SkipExisting), Decision::Insert));
        assert!(matches!(decide(Some(4), UpdatePolicy::AlwaysRefresh, SkipExisting), Decision::Replace(4)));
        assert!(matches!(decide(Some(4), UpdatePolicy::SkipUnlessForced, SkipExisting), Decision::Skip));
        assert!(matches!(decide(Some(4), UpdatePolicy::SkipUnlessForced, ForceOverwrite), Decision::Replace(4)));
        assert!(matches!(decide(Some(4), UpdatePolicy::Immutable, ForceOverwrite), Decision::Skip));
    }

    #[tokio::test]
    async fn skip_existing_leaves_catalog_rows_untouched() {
        let (reconciler, store) = reconciler();
        let first = CanonicalRecord::Layer(layer("Snow Cover", "first"));
        let second = CanonicalRecord::Layer(layer("Snow Cover v2", "second"));

        assert_eq!(reconciler.reconcile(&first, ReconcileMode::SkipExisting).await.unwrap(), Outcome::Created);
        let after_first = store.find_layer("MODIS_Terra_Snow_Cover").await.unwrap().unwrap();
        assert_eq!(reconciler.reconcile(&second, ReconcileMode::SkipExisting).await.unwrap(), Outcome::Skipped);
        let after_second = store.find_layer("MODIS_Terra_Snow_Cover").await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn force_overwrite_drops_stale_values() {
        let (reconciler, store) = reconciler();
        reconciler
            .reconcile(&CanonicalRecord::Layer(layer("Snow", "old")), ReconcileMode::SkipExisting)
            .await
            .unwrap();

        let mut replacement = layer("Snow (new)", "");
        replacement.start_date = None;
        replacement.tags = vec![];
        let outcome = reconciler
            .reconcile(&CanonicalRecord::Layer(replacement.clone()), ReconcileMode::ForceOverwrite)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Updated);
        let stored = store.find_layer("MODIS_Terra_Snow_Cover").await.unwrap().unwrap();
        assert_eq!(stored.content(), replacement);
    }

    #[tokio::test]
    async fn daily_images_always_refresh() {
        let (reconciler, store) = reconciler();
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(reconciler.reconcile(&daily("Old"), ReconcileMode::SkipExisting).await.unwrap(), Outcome::Created);
        assert_eq!(reconciler.reconcile(&daily("New"), ReconcileMode::SkipExisting).await.unwrap(), Outcome::Updated);
        let stored = store.find_daily_image_by_date(date).await.unwrap().unwrap();
        assert_eq!(stored.title, "New");
        assert_eq!(stored.explanation, "New explained");
        assert_eq!(store.status_summary().await.unwrap().total_images, 1);
    }

    #[tokio::test]
    async fn coordinates_are_created_once_and_never_rewritten() {
        let (reconciler, store) = reconciler();
        let mk = |kind: &str| {
            CanonicalRecord::Coordinate(CoordinateDraft {
                name: "Olympus Mons".into(),
                body: "Mars".into(),
                kind: kind.into(),
                latitude: 18.65,
                longitude: 133.8,
                description: None,
                daily_image_id: None,
            })
        };
        assert_eq!(reconciler.reconcile(&mk("mountain"), ReconcileMode::ForceOverwrite).await.unwrap(), Outcome::Created);
        assert_eq!(reconciler.reconcile(&mk("volcano"), ReconcileMode::ForceOverwrite).await.unwrap(), Outcome::Skipped);
        let stored = store.find_coordinate("Olympus Mons", "Mars").await.unwrap().unwrap();
        assert_eq!(stored.kind, "mountain");
    }
}
