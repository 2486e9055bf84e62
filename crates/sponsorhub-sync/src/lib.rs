//! Persistence backends for the canonical state document and the sponsors
//! table, plus the reconciler that keeps the two in step.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sponsorhub_core::{
    diff_state, drift, AppStateDocument, ApplySummary, DiffResult, DriftReport, Sponsor,
    SponsorPatch, ValidationError,
};
use sponsorhub_storage::{AuditLog, BackupError, BackupStore};
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
pub mod file_store;
pub mod pg_store;
pub mod reconcile;
pub mod remote_store;

pub use config::{BackendKind, StoreConfig};
pub use file_store::FileStore;
pub use pg_store::PgStore;
pub use reconcile::Reconciler;
pub use remote_store::RemoteStore;

pub const CRATE_NAME: &str = "sponsorhub-sync";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sponsor {0} not found")]
    SponsorNotFound(String),
    #[error("sponsor {0} already exists")]
    SponsorExists(String),
    #[error("sponsor row has no id")]
    MissingId,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("backup {name} is not a valid state document: {source}")]
    InvalidBackup {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("remote store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote store returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Errors caused by the request itself rather than the backend.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::SponsorExists(_)
                | Self::MissingId
                | Self::InvalidBackup { .. }
                | Self::Backup(BackupError::InvalidName(_))
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SponsorNotFound(_) | Self::Backup(BackupError::NotFound(_))
        )
    }
}

/// One row of the normalized sponsors table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SponsorRow {
    pub id: String,
    #[serde(default)]
    pub sponsor_year: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub sponsorship_type: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_contract_signed: bool,
    #[serde(default)]
    pub is_logo_received: bool,
    #[serde(default)]
    pub is_banner_placed: bool,
    #[serde(default)]
    pub is_payment_received: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl SponsorRow {
    pub fn from_sponsor(sponsor: &Sponsor) -> Result<Self, StoreError> {
        let id = sponsor.id.clone().ok_or(StoreError::MissingId)?;
        Ok(Self {
            id,
            sponsor_year: sponsor.sponsor_year,
            name: sponsor.name.clone(),
            company: sponsor.company.clone(),
            contact: sponsor.contact.clone(),
            phone: sponsor.phone.clone(),
            sponsorship_type: sponsor.sponsorship_type.clone(),
            event_type: sponsor.event_type.clone(),
            amount: sponsor.amount,
            status: sponsor.status.clone(),
            is_contract_signed: sponsor.is_contract_signed,
            is_logo_received: sponsor.is_logo_received,
            is_banner_placed: sponsor.is_banner_placed,
            is_payment_received: sponsor.is_payment_received,
            notes: sponsor.notes.clone(),
            date: sponsor.date,
        })
    }

    pub fn into_sponsor(self) -> Sponsor {
        Sponsor {
            id: Some(self.id),
            sponsor_year: self.sponsor_year,
            name: self.name,
            company: self.company,
            contact: self.contact,
            phone: self.phone,
            sponsorship_type: self.sponsorship_type,
            event_type: self.event_type,
            amount: self.amount,
            status: self.status,
            is_contract_signed: self.is_contract_signed,
            is_logo_received: self.is_logo_received,
            is_banner_placed: self.is_banner_placed,
            is_payment_received: self.is_payment_received,
            notes: self.notes,
            date: self.date,
            extra: Default::default(),
        }
    }
}

/// Table rows for an already-prepared sponsor list. Every sponsor must
/// carry an id by now.
pub(crate) fn rows_for_apply(sponsors: &[Sponsor]) -> Result<Vec<SponsorRow>, StoreError> {
    sponsors.iter().map(SponsorRow::from_sponsor).collect()
}

/// Rows used to seed an empty table from the document at first boot.
/// Sponsors without an id or with an invalid amount are skipped.
pub(crate) fn seed_rows(document: &AppStateDocument) -> Vec<SponsorRow> {
    let Some(sponsors) = document.sponsors.as_deref() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    let mut rows = Vec::with_capacity(sponsors.len());
    for sponsor in sponsors {
        if let Err(err) = sponsor.validate() {
            warn!(error = %err, "skipping sponsor while seeding table");
            continue;
        }
        match SponsorRow::from_sponsor(sponsor) {
            Ok(row) if seen.insert(row.id.clone()) => rows.push(row),
            Ok(row) => warn!(id = %row.id, "skipping duplicate sponsor while seeding table"),
            Err(_) => warn!("skipping sponsor without id while seeding table"),
        }
    }
    rows
}

pub(crate) fn rows_into_sponsors(rows: Vec<SponsorRow>) -> Vec<Sponsor> {
    rows.into_iter().map(SponsorRow::into_sponsor).collect()
}

/// Re-syncs the document's embedded list with the table after a single
/// sponsor mutation. `changed` is the sponsor just written, so its own
/// client-side fields land in the document too.
pub(crate) fn resync_embedded(
    document: &mut AppStateDocument,
    rows: Vec<SponsorRow>,
    changed: Option<&Sponsor>,
) {
    let sponsors = rows
        .into_iter()
        .map(|row| match changed {
            Some(sponsor) if sponsor.id.as_deref() == Some(row.id.as_str()) => sponsor.clone(),
            _ => row.into_sponsor(),
        })
        .collect();
    document.resync_sponsors(sponsors);
}

/// Persistence for the singleton document and the sponsors table.
///
/// `apply_state` receives a document whose sponsors already carry ids. It
/// overwrites the document, upserts every listed sponsor and deletes rows
/// whose id is not listed. A document without a sponsor list leaves the
/// table untouched.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Creates missing schema and the singleton document; seeds an empty
    /// table from the document.
    async fn init(&self) -> Result<(), StoreError>;

    async fn get_state(&self) -> Result<AppStateDocument, StoreError>;

    async fn apply_state(&self, incoming: &AppStateDocument) -> Result<ApplySummary, StoreError>;

    async fn sponsor_ids(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn diff_state(&self, incoming: &AppStateDocument) -> Result<DiffResult, StoreError> {
        let existing = self.sponsor_ids().await?;
        Ok(diff_state(&existing, incoming))
    }

    async fn drift(&self) -> Result<DriftReport, StoreError> {
        let document = self.get_state().await?;
        let table_ids = self.sponsor_ids().await?;
        Ok(drift(&document, &table_ids))
    }

    /// Rows ordered by company, then name, nulls last.
    async fn list_sponsors(&self) -> Result<Vec<Sponsor>, StoreError>;

    async fn get_sponsor(&self, id: &str) -> Result<Option<Sponsor>, StoreError>;

    /// The sponsor CRUD operations below re-sync the document's sponsor
    /// list from the table as part of the same write.
    async fn create_sponsor(&self, sponsor: Sponsor) -> Result<Sponsor, StoreError>;

    async fn update_sponsor(&self, id: &str, patch: SponsorPatch) -> Result<Sponsor, StoreError>;

    async fn delete_sponsor(&self, id: &str) -> Result<(), StoreError>;
}

/// Builds the configured backend, runs its init and wraps it in a
/// reconciler. `Ok(None)` when persistence is switched off.
pub async fn open_reconciler(config: &StoreConfig) -> Result<Option<Reconciler>, StoreError> {
    let store: Arc<dyn StateStore> = match config.backend {
        BackendKind::Disabled => {
            warn!("persistence disabled; state endpoints will answer 500");
            return Ok(None);
        }
        BackendKind::File => Arc::new(FileStore::in_dir(&config.data_dir)),
        BackendKind::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                StoreError::Config("STORAGE_BACKEND=postgres requires DATABASE_URL".to_string())
            })?;
            Arc::new(PgStore::connect(url, config.upsert_chunk_size).await?)
        }
        BackendKind::Remote => {
            let (url, key) = config
                .supabase_url
                .as_deref()
                .zip(config.supabase_key.as_deref())
                .ok_or_else(|| {
                    StoreError::Config(
                        "STORAGE_BACKEND=remote requires SUPABASE_URL and SUPABASE_KEY".to_string(),
                    )
                })?;
            Arc::new(RemoteStore::new(url, key, config.upsert_chunk_size)?)
        }
    };

    store.init().await?;
    info!(backend = store.backend_name(), data_dir = %config.data_dir.display(), "state store ready");
    Ok(Some(Reconciler::new(
        store,
        BackupStore::new(config.backups_dir()),
        AuditLog::in_dir(config.logs_dir()),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_drop_client_only_fields() {
        let sponsor: Sponsor = serde_json::from_value(json!({
            "id": "id-1",
            "company": "Acme",
            "amount": "1,500",
            "isPaymentReceived": "true",
            "dateAdded": "2026-01-02"
        }))
        .unwrap();
        let row = SponsorRow::from_sponsor(&sponsor).unwrap();
        assert_eq!(row.amount, 1500.0);
        assert!(row.is_payment_received);

        let back = row.into_sponsor();
        assert_eq!(back.id.as_deref(), Some("id-1"));
        assert!(back.extra.is_empty());
    }

    #[test]
    fn rows_require_an_id() {
        assert!(matches!(
            SponsorRow::from_sponsor(&Sponsor::default()),
            Err(StoreError::MissingId)
        ));
    }

    #[test]
    fn seeding_skips_unusable_sponsors() {
        let doc: AppStateDocument = serde_json::from_value(json!({
            "sponsors": [
                {"id": "a", "amount": 10},
                {"company": "no id"},
                {"id": "b", "amount": -5},
                {"id": "a", "amount": 20}
            ]
        }))
        .unwrap();
        let rows = seed_rows(&doc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
        assert_eq!(rows[0].amount, 10.0);
    }

    #[test]
    fn error_classification() {
        assert!(StoreError::SponsorNotFound("x".into()).is_not_found());
        assert!(StoreError::Backup(BackupError::NotFound("x.json".into())).is_not_found());
        assert!(StoreError::Backup(BackupError::InvalidName("../x".into())).is_invalid_input());
        assert!(!StoreError::Config("x".into()).is_invalid_input());
    }
}
