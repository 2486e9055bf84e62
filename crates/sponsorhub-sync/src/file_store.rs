//! Single-file backend: the document and the sponsors table live side by
//! side in one JSON file, rewritten atomically on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sponsorhub_core::{listing_order, AppStateDocument, ApplySummary, Sponsor, SponsorPatch};
use sponsorhub_storage::write_atomic;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    resync_embedded, rows_for_apply, rows_into_sponsors, seed_rows, SponsorRow, StateStore,
    StoreError,
};

pub const STORE_FILE: &str = "store.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    state: AppStateDocument,
    #[serde(default)]
    sponsors: BTreeMap<String, SponsorRow>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl StoreFile {
    fn resync_document(&mut self, changed: Option<&Sponsor>) {
        let rows = self.sponsors.values().cloned().collect();
        resync_embedded(&mut self.state, rows, changed);
    }
}

/// Every mutation is a read-modify-write under one async lock.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Option<StoreFile>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_or_default(&self) -> Result<StoreFile, StoreError> {
        Ok(self.load().await?.unwrap_or_default())
    }

    async fn save(&self, file: &mut StoreFile) -> Result<(), StoreError> {
        file.updated_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(file)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn init(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let existing = self.load().await?;
        let created = existing.is_none();
        let mut file = existing.unwrap_or_default();

        let mut seeded = 0;
        if file.sponsors.is_empty() {
            for row in seed_rows(&file.state) {
                file.sponsors.insert(row.id.clone(), row);
                seeded += 1;
            }
        }

        if created || seeded > 0 {
            self.save(&mut file).await?;
            info!(path = %self.path.display(), created, seeded, "initialized file store");
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<AppStateDocument, StoreError> {
        Ok(self.load_or_default().await?.state)
    }

    async fn apply_state(&self, incoming: &AppStateDocument) -> Result<ApplySummary, StoreError> {
        let rows = incoming.sponsors.as_deref().map(rows_for_apply).transpose()?;

        let _guard = self.lock.lock().await;
        let mut file = self.load_or_default().await?;
        file.state = incoming.clone();

        let mut summary = ApplySummary::default();
        if let Some(rows) = rows {
            let keep: BTreeSet<String> = rows.iter().map(|row| row.id.clone()).collect();
            summary.upserts = rows.len();
            for row in rows {
                file.sponsors.insert(row.id.clone(), row);
            }
            let before = file.sponsors.len();
            file.sponsors.retain(|id, _| keep.contains(id));
            summary.deletes = before - file.sponsors.len();
        }

        self.save(&mut file).await?;
        Ok(summary)
    }

    async fn sponsor_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.load_or_default().await?.sponsors.into_keys().collect())
    }

    async fn list_sponsors(&self) -> Result<Vec<Sponsor>, StoreError> {
        let file = self.load_or_default().await?;
        let mut sponsors = rows_into_sponsors(file.sponsors.into_values().collect());
        sponsors.sort_by(listing_order);
        Ok(sponsors)
    }

    async fn get_sponsor(&self, id: &str) -> Result<Option<Sponsor>, StoreError> {
        let mut file = self.load_or_default().await?;
        Ok(file.sponsors.remove(id).map(SponsorRow::into_sponsor))
    }

    async fn create_sponsor(&self, mut sponsor: Sponsor) -> Result<Sponsor, StoreError> {
        sponsor.prepare_for_storage(Utc::now())?;
        let row = SponsorRow::from_sponsor(&sponsor)?;

        let _guard = self.lock.lock().await;
        let mut file = self.load_or_default().await?;
        if file.sponsors.contains_key(&row.id) {
            return Err(StoreError::SponsorExists(row.id));
        }
        file.sponsors.insert(row.id.clone(), row);
        file.resync_document(Some(&sponsor));
        self.save(&mut file).await?;
        Ok(sponsor)
    }

    async fn update_sponsor(&self, id: &str, patch: SponsorPatch) -> Result<Sponsor, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load_or_default().await?;
        let row = file
            .sponsors
            .get_mut(id)
            .ok_or_else(|| StoreError::SponsorNotFound(id.to_string()))?;

        let mut sponsor = row.clone().into_sponsor();
        patch.apply_to(&mut sponsor)?;
        *row = SponsorRow::from_sponsor(&sponsor)?;

        file.resync_document(Some(&sponsor));
        self.save(&mut file).await?;
        Ok(sponsor)
    }

    async fn delete_sponsor(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load_or_default().await?;
        if file.sponsors.remove(id).is_none() {
            return Err(StoreError::SponsorNotFound(id.to_string()));
        }
        file.resync_document(None);
        self.save(&mut file).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn document(value: serde_json::Value) -> AppStateDocument {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn init_creates_an_empty_document_once() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store.init().await.unwrap();

        let state = store.get_state().await.unwrap();
        assert_eq!(state.sponsors.as_deref().map(<[Sponsor]>::len), Some(0));
        assert!(state.events.is_empty());
        assert!(store.path().exists());

        store
            .apply_state(&document(json!({"sponsors": [{"id": "a"}]})))
            .await
            .unwrap();
        store.init().await.unwrap();
        assert_eq!(store.sponsor_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn init_seeds_an_empty_table_from_the_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let seeded = json!({
            "state": {"sponsors": [{"id": "a", "company": "Acme"}, {"id": "b"}]},
            "sponsors": {}
        });
        std::fs::write(&path, serde_json::to_vec(&seeded).unwrap()).unwrap();

        let store = FileStore::new(&path);
        store.init().await.unwrap();
        let ids: Vec<String> = store.sponsor_ids().await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn apply_upserts_and_deletes_by_id() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store.init().await.unwrap();
        store
            .apply_state(&document(json!({"sponsors": [{"id": "A"}, {"id": "B"}]})))
            .await
            .unwrap();

        let summary = store
            .apply_state(&document(json!({"sponsors": [{"id": "B", "amount": 5}, {"id": "C"}]})))
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary { upserts: 2, deletes: 1 });

        let ids: Vec<String> = store.sponsor_ids().await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["B", "C"]);
        let b = store.get_sponsor("B").await.unwrap().unwrap();
        assert_eq!(b.amount, 5.0);
    }

    #[tokio::test]
    async fn document_without_sponsor_list_leaves_table_alone() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store
            .apply_state(&document(json!({"sponsors": [{"id": "A"}]})))
            .await
            .unwrap();

        let summary = store
            .apply_state(&document(json!({"events": [{"title": "gala"}]})))
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary::default());
        assert_eq!(store.sponsor_ids().await.unwrap().len(), 1);
        assert_eq!(store.get_state().await.unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn crud_keeps_document_in_step_with_table() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store.init().await.unwrap();

        let created = store
            .create_sponsor(Sponsor {
                company: Some("Zeta".into()),
                amount: 100.0,
                ..Default::default()
            })
            .await
            .unwrap();
        let id = created.id.clone().unwrap();
        assert!(created.date.is_some());
        assert!(store.get_state().await.unwrap().sponsor_ids().contains(&id));

        let updated = store
            .update_sponsor(
                &id,
                SponsorPatch {
                    amount: Some(250.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.amount, 250.0);
        let embedded = store.get_state().await.unwrap().sponsors.unwrap();
        assert_eq!(embedded[0].amount, 250.0);

        store.delete_sponsor(&id).await.unwrap();
        assert!(store.get_state().await.unwrap().sponsor_ids().is_empty());
        assert!(matches!(
            store.delete_sponsor(&id).await,
            Err(StoreError::SponsorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn crud_keeps_client_fields_of_embedded_sponsors() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store
            .apply_state(&document(json!({"sponsors": [
                {"id": "A", "company": "Acme", "tickets": {"vip": 4}, "dateAdded": "2024-03-01"}
            ]})))
            .await
            .unwrap();

        let mut fresh = Sponsor {
            id: Some("B".into()),
            ..Default::default()
        };
        fresh.extra.insert("sponsorTasks".into(), json!(["send logo"]));
        store.create_sponsor(fresh).await.unwrap();
        store
            .update_sponsor(
                "A",
                SponsorPatch {
                    amount: Some(10.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.delete_sponsor("B").await.unwrap();

        let embedded = store.get_state().await.unwrap().sponsors.unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].amount, 10.0);
        assert_eq!(embedded[0].extra["tickets"], json!({"vip": 4}));
        assert_eq!(embedded[0].extra["dateAdded"], json!("2024-03-01"));
    }

    #[tokio::test]
    async fn created_sponsor_fields_reach_the_document() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store.init().await.unwrap();

        let mut fresh = Sponsor {
            id: Some("B".into()),
            ..Default::default()
        };
        fresh.extra.insert("sponsorTasks".into(), json!(["send logo"]));
        store.create_sponsor(fresh).await.unwrap();

        let embedded = store.get_state().await.unwrap().sponsors.unwrap();
        assert_eq!(embedded[0].extra["sponsorTasks"], json!(["send logo"]));
    }

    #[tokio::test]
    async fn create_rejects_taken_ids() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        let sponsor = Sponsor {
            id: Some("dup".into()),
            ..Default::default()
        };
        store.create_sponsor(sponsor.clone()).await.unwrap();
        assert!(matches!(
            store.create_sponsor(sponsor).await,
            Err(StoreError::SponsorExists(id)) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn listing_is_ordered_by_company_then_name() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        store
            .apply_state(&document(json!({"sponsors": [
                {"id": "1", "name": "x"},
                {"id": "2", "company": "Beta", "name": "b"},
                {"id": "3", "company": "Alpha", "name": "z"},
                {"id": "4", "company": "Alpha", "name": "a"}
            ]})))
            .await
            .unwrap();
        let ids: Vec<String> = store
            .list_sponsors()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["4", "3", "2", "1"]);
    }
}
