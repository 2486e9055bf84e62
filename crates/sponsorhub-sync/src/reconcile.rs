//! Save and restore orchestration: snapshot the current document, apply the
//! incoming one through the store, then record the outcome.

use std::sync::Arc;

use chrono::Utc;
use sponsorhub_core::{AppStateDocument, ApplySummary, DiffResult, DriftReport};
use sponsorhub_storage::{AuditEntry, AuditKind, AuditLog, BackupStore, StoredBackup};
use tracing::{info, info_span, warn, Instrument};

use crate::{StateStore, StoreError};

pub const APPLY_TARGET: &str = "state";

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    backups: BackupStore,
    audit: AuditLog,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StateStore>, backups: BackupStore, audit: AuditLog) -> Self {
        Self {
            store,
            backups,
            audit,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub async fn get_state(&self) -> Result<AppStateDocument, StoreError> {
        self.store.get_state().await
    }

    /// What an apply of `incoming` would upsert and delete. Writes nothing.
    pub async fn preview(&self, incoming: &AppStateDocument) -> Result<DiffResult, StoreError> {
        self.store.diff_state(incoming).await
    }

    pub async fn apply(&self, incoming: AppStateDocument) -> Result<ApplySummary, StoreError> {
        self.commit(incoming, AuditKind::Apply, APPLY_TARGET).await
    }

    pub async fn drift(&self) -> Result<DriftReport, StoreError> {
        self.store.drift().await
    }

    pub async fn list_backups(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.backups.list().await?)
    }

    pub async fn read_backup(&self, file: &str) -> Result<Vec<u8>, StoreError> {
        Ok(self.backups.read(file).await?)
    }

    /// Parses a backup as a state document without touching the store.
    pub async fn load_backup(&self, file: &str) -> Result<AppStateDocument, StoreError> {
        let bytes = self.backups.read(file).await?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::InvalidBackup {
            name: file.to_string(),
            source,
        })
    }

    pub async fn preview_restore(&self, file: &str) -> Result<DiffResult, StoreError> {
        let document = self.load_backup(file).await?;
        self.preview(&document).await
    }

    /// Restoring is an apply whose payload comes from a backup, so it is
    /// itself backed up and logged.
    pub async fn restore(&self, file: &str) -> Result<ApplySummary, StoreError> {
        let document = self.load_backup(file).await?;
        self.commit(document, AuditKind::Restore, file).await
    }

    /// Applied-changes log lines, newest first.
    pub async fn applied_changes(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self.audit.tail(limit).await?)
    }

    async fn commit(
        &self,
        mut incoming: AppStateDocument,
        kind: AuditKind,
        target: &str,
    ) -> Result<ApplySummary, StoreError> {
        incoming.prepare_for_apply(Utc::now())?;

        let span = info_span!("apply_state", kind = %kind, target = %target);
        async {
            self.snapshot_current().await;

            let summary = self.store.apply_state(&incoming).await?;
            info!(
                upserts = summary.upserts,
                deletes = summary.deletes,
                "state applied"
            );

            if let Err(err) = self.audit.append(&AuditEntry::new(kind, target, summary)).await {
                warn!(error = %err, "failed to append applied-changes log");
            }
            Ok::<_, StoreError>(summary)
        }
        .instrument(span)
        .await
    }

    /// Best effort: a failed snapshot is logged and the apply goes ahead.
    async fn snapshot_current(&self) -> Option<StoredBackup> {
        let current = match self.store.get_state().await {
            Ok(current) => current,
            Err(err) => {
                warn!(error = %err, "could not read current state for backup");
                return None;
            }
        };
        match self.backups.write_snapshot(Utc::now(), &current).await {
            Ok(backup) => {
                info!(file = %backup.file_name, bytes = backup.byte_size, "wrote state backup");
                Some(backup)
            }
            Err(err) => {
                warn!(error = %err, "failed to write state backup");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use serde_json::json;
    use sponsorhub_core::{Sponsor, SponsorPatch, ValidationError};
    use tempfile::{tempdir, TempDir};

    use crate::FileStore;

    fn document(value: serde_json::Value) -> AppStateDocument {
        serde_json::from_value(value).unwrap()
    }

    fn reconciler_with(store: Arc<dyn StateStore>, dir: &TempDir) -> Reconciler {
        Reconciler::new(
            store,
            BackupStore::new(dir.path().join("backups")),
            AuditLog::in_dir(dir.path().join("logs")),
        )
    }

    async fn file_reconciler(dir: &TempDir) -> Reconciler {
        let store = FileStore::in_dir(dir.path());
        store.init().await.unwrap();
        reconciler_with(Arc::new(store), dir)
    }

    async fn table_ids(reconciler: &Reconciler) -> Vec<String> {
        reconciler
            .store()
            .sponsor_ids()
            .await
            .unwrap()
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn preview_then_apply_replaces_the_sponsor_set() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}, {"id": "B"}]})))
            .await
            .unwrap();

        let incoming = document(json!({"sponsors": [{"id": "B"}, {"id": "C"}]}));
        let preview = reconciler.preview(&incoming).await.unwrap();
        assert_eq!(preview.upsert_count, 1);
        assert_eq!(preview.delete_count, 1);
        assert_eq!(preview.sample_upsert_ids, vec!["C"]);
        assert_eq!(preview.sample_delete_ids, vec!["A"]);

        let summary = reconciler.apply(incoming).await.unwrap();
        assert_eq!(summary, ApplySummary { upserts: 2, deletes: 1 });
        assert_eq!(table_ids(&reconciler).await, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn preview_writes_nothing() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}]})))
            .await
            .unwrap();
        let state_before = reconciler.get_state().await.unwrap();
        let backups_before = reconciler.list_backups().await.unwrap();
        let log_before = reconciler.applied_changes(200).await.unwrap();

        reconciler
            .preview(&document(json!({"sponsors": [], "events": [{"title": "gala"}]})))
            .await
            .unwrap();

        assert_eq!(reconciler.get_state().await.unwrap(), state_before);
        assert_eq!(table_ids(&reconciler).await, vec!["A"]);
        assert_eq!(reconciler.list_backups().await.unwrap(), backups_before);
        assert_eq!(reconciler.applied_changes(200).await.unwrap(), log_before);
    }

    #[tokio::test]
    async fn every_apply_backs_up_and_logs_once() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        let doc = document(json!({"sponsors": [{"id": "A"}]}));

        reconciler.apply(doc.clone()).await.unwrap();
        reconciler.apply(doc).await.unwrap();

        assert_eq!(reconciler.list_backups().await.unwrap().len(), 2);
        let log = reconciler.applied_changes(200).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].ends_with("APPLY state: upserts=1 deletes=0"));
    }

    #[tokio::test]
    async fn empty_list_deletes_all_rows() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}, {"id": "B"}, {"id": "C"}]})))
            .await
            .unwrap();

        let summary = reconciler
            .apply(document(json!({"sponsors": []})))
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary { upserts: 0, deletes: 3 });
        assert!(table_ids(&reconciler).await.is_empty());
        let state = reconciler.get_state().await.unwrap();
        assert_eq!(state.sponsors.map(|s| s.len()), Some(0));
    }

    #[tokio::test]
    async fn generated_ids_land_in_document_and_table() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        let summary = reconciler
            .apply(document(json!({"sponsors": [{"company": "Acme", "amount": "$1,000"}]})))
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary { upserts: 1, deletes: 0 });

        let state = reconciler.get_state().await.unwrap();
        let doc_ids = state.sponsor_ids();
        assert_eq!(doc_ids.len(), 1);
        let id = doc_ids.iter().next().unwrap();
        assert!(id.starts_with("id-"));
        assert_eq!(table_ids(&reconciler).await, vec![id.clone()]);
        assert!(reconciler.drift().await.unwrap().in_sync);
    }

    #[tokio::test]
    async fn invalid_amount_is_rejected_before_any_write() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        let err = reconciler
            .apply(document(json!({"sponsors": [{"id": "A", "amount": -1}]})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::InvalidAmount { .. })
        ));
        assert!(reconciler.list_backups().await.unwrap().is_empty());
        assert!(table_ids(&reconciler).await.is_empty());
    }

    #[tokio::test]
    async fn restore_round_trips_a_previous_document() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}], "tasks": [{"t": 1}]})))
            .await
            .unwrap();
        reconciler
            .apply(document(json!({"sponsors": [{"id": "B"}]})))
            .await
            .unwrap();

        // newest backup holds the document as it was before the second apply
        let backups = reconciler.list_backups().await.unwrap();
        let newest = &backups[0];
        let preview = reconciler.preview_restore(newest).await.unwrap();
        assert_eq!(preview.sample_upsert_ids, vec!["A"]);
        assert_eq!(preview.sample_delete_ids, vec!["B"]);

        let summary = reconciler.restore(newest).await.unwrap();
        assert_eq!(summary, ApplySummary { upserts: 1, deletes: 1 });
        assert_eq!(table_ids(&reconciler).await, vec!["A"]);
        assert_eq!(reconciler.get_state().await.unwrap().tasks.len(), 1);

        let log = reconciler.applied_changes(1).await.unwrap();
        assert!(log[0].contains(&format!("RESTORE {newest}: upserts=1 deletes=1")));
        assert_eq!(reconciler.list_backups().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn restore_rejects_malformed_and_unknown_backups() {
        let dir = tempdir().unwrap();
        let reconciler = file_reconciler(&dir).await;
        reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}]})))
            .await
            .unwrap();
        let backups_dir = dir.path().join("backups");
        std::fs::write(backups_dir.join("broken.json"), b"{not json").unwrap();

        let err = reconciler.restore("broken.json").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidBackup { .. }));
        assert!(err.is_invalid_input());
        assert_eq!(table_ids(&reconciler).await, vec!["A"]);

        assert!(reconciler.restore("missing.json").await.unwrap_err().is_not_found());
        assert!(reconciler
            .restore("../store.json")
            .await
            .unwrap_err()
            .is_invalid_input());
    }

    /// Reads through to a file store but refuses every write.
    struct FailingWrites(FileStore);

    #[async_trait]
    impl StateStore for FailingWrites {
        fn backend_name(&self) -> &'static str {
            "failing"
        }
        async fn init(&self) -> Result<(), StoreError> {
            self.0.init().await
        }
        async fn get_state(&self) -> Result<AppStateDocument, StoreError> {
            self.0.get_state().await
        }
        async fn apply_state(&self, _: &AppStateDocument) -> Result<ApplySummary, StoreError> {
            Err(StoreError::Remote {
                status: 503,
                body: "unavailable".into(),
            })
        }
        async fn sponsor_ids(&self) -> Result<BTreeSet<String>, StoreError> {
            self.0.sponsor_ids().await
        }
        async fn list_sponsors(&self) -> Result<Vec<Sponsor>, StoreError> {
            self.0.list_sponsors().await
        }
        async fn get_sponsor(&self, id: &str) -> Result<Option<Sponsor>, StoreError> {
            self.0.get_sponsor(id).await
        }
        async fn create_sponsor(&self, sponsor: Sponsor) -> Result<Sponsor, StoreError> {
            self.0.create_sponsor(sponsor).await
        }
        async fn update_sponsor(
            &self,
            id: &str,
            patch: SponsorPatch,
        ) -> Result<Sponsor, StoreError> {
            self.0.update_sponsor(id, patch).await
        }
        async fn delete_sponsor(&self, id: &str) -> Result<(), StoreError> {
            self.0.delete_sponsor(id).await
        }
    }

    #[tokio::test]
    async fn failed_apply_keeps_backup_and_skips_log() {
        let dir = tempdir().unwrap();
        let inner = FileStore::in_dir(dir.path());
        inner.init().await.unwrap();
        inner
            .apply_state(&document(json!({"sponsors": [{"id": "keep"}], "notes": ["n"]})))
            .await
            .unwrap();
        let reconciler = reconciler_with(Arc::new(FailingWrites(inner)), &dir);
        let state_before = reconciler.get_state().await.unwrap();

        let err = reconciler
            .apply(document(json!({"sponsors": [{"id": "A"}]})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Remote { status: 503, .. }));
        assert_eq!(reconciler.get_state().await.unwrap(), state_before);
        assert_eq!(reconciler.list_backups().await.unwrap().len(), 1);
        assert!(reconciler.applied_changes(200).await.unwrap().is_empty());
        assert_eq!(table_ids(&reconciler).await, vec!["keep"]);
    }
}
