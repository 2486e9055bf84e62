//! PostgreSQL backend. Every write runs in one transaction that locks the
//! singleton document row first.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sponsorhub_core::{upsert_chunks, AppStateDocument, ApplySummary, Sponsor, SponsorPatch};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::info;

use crate::{
    resync_embedded, rows_for_apply, rows_into_sponsors, seed_rows, SponsorRow, StateStore,
    StoreError,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SELECT_SPONSORS: &str = r#"
    SELECT id, sponsor_year, name, company, contact, phone, sponsorship_type, event_type,
           amount, status, is_contract_signed, is_logo_received, is_banner_placed,
           is_payment_received, notes, date
      FROM sponsors
"#;

const INSERT_SPONSORS: &str = "INSERT INTO sponsors (id, sponsor_year, name, company, contact, \
     phone, sponsorship_type, event_type, amount, status, is_contract_signed, is_logo_received, \
     is_banner_placed, is_payment_received, notes, date) ";

const ON_CONFLICT_UPDATE: &str = r#"
    ON CONFLICT (id) DO UPDATE SET
        sponsor_year = EXCLUDED.sponsor_year,
        name = EXCLUDED.name,
        company = EXCLUDED.company,
        contact = EXCLUDED.contact,
        phone = EXCLUDED.phone,
        sponsorship_type = EXCLUDED.sponsorship_type,
        event_type = EXCLUDED.event_type,
        amount = EXCLUDED.amount,
        status = EXCLUDED.status,
        is_contract_signed = EXCLUDED.is_contract_signed,
        is_logo_received = EXCLUDED.is_logo_received,
        is_banner_placed = EXCLUDED.is_banner_placed,
        is_payment_received = EXCLUDED.is_payment_received,
        notes = EXCLUDED.notes,
        date = EXCLUDED.date,
        updated_at = NOW()
"#;

#[derive(Debug, Clone, Copy)]
enum OnConflict {
    Update,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PgStore {
    pub async fn connect(database_url: &str, chunk_size: usize) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, chunk_size))
    }

    pub fn new(pool: PgPool, chunk_size: usize) -> Self {
        Self { pool, chunk_size }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Rewrites the document's sponsor list from the table and commits.
    async fn commit_with_resync(
        mut tx: Transaction<'_, Postgres>,
        mut document: AppStateDocument,
        changed: Option<&Sponsor>,
    ) -> Result<(), StoreError> {
        let rows = fetch_rows(&mut tx).await?;
        resync_embedded(&mut document, rows, changed);
        write_document(&mut tx, &document).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn row_from_pg(row: &PgRow) -> Result<SponsorRow, sqlx::Error> {
    Ok(SponsorRow {
        id: row.try_get("id")?,
        sponsor_year: row.try_get("sponsor_year")?,
        name: row.try_get("name")?,
        company: row.try_get("company")?,
        contact: row.try_get("contact")?,
        phone: row.try_get("phone")?,
        sponsorship_type: row.try_get("sponsorship_type")?,
        event_type: row.try_get("event_type")?,
        amount: row.try_get("amount")?,
        status: row.try_get("status")?,
        is_contract_signed: row.try_get("is_contract_signed")?,
        is_logo_received: row.try_get("is_logo_received")?,
        is_banner_placed: row.try_get("is_banner_placed")?,
        is_payment_received: row.try_get("is_payment_received")?,
        notes: row.try_get("notes")?,
        date: row.try_get("date")?,
    })
}

async fn fetch_rows(conn: &mut PgConnection) -> Result<Vec<SponsorRow>, StoreError> {
    let mut query: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_SPONSORS);
    query.push(" ORDER BY company ASC NULLS LAST, name ASC NULLS LAST, id");
    let rows = query.build().fetch_all(&mut *conn).await?;
    Ok(rows
        .iter()
        .map(row_from_pg)
        .collect::<Result<Vec<_>, sqlx::Error>>()?)
}

async fn fetch_row(
    conn: &mut PgConnection,
    id: &str,
    for_update: bool,
) -> Result<Option<SponsorRow>, StoreError> {
    let mut query: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_SPONSORS);
    query.push(" WHERE id = ").push_bind(id);
    if for_update {
        query.push(" FOR UPDATE");
    }
    let row = query.build().fetch_optional(&mut *conn).await?;
    Ok(row.as_ref().map(row_from_pg).transpose()?)
}

async fn read_document(
    conn: &mut PgConnection,
    for_update: bool,
) -> Result<AppStateDocument, StoreError> {
    let sql = if for_update {
        "SELECT data FROM app_state WHERE id = 1 FOR UPDATE"
    } else {
        "SELECT data FROM app_state WHERE id = 1"
    };
    let row: Option<(Json<Value>,)> = sqlx::query_as(sql).fetch_optional(&mut *conn).await?;
    match row {
        Some((Json(data),)) => Ok(serde_json::from_value(data)?),
        None => Ok(AppStateDocument::empty()),
    }
}

async fn write_document(
    conn: &mut PgConnection,
    document: &AppStateDocument,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO app_state (id, data, updated_at)
        VALUES (1, $1, NOW())
        ON CONFLICT (id) DO UPDATE
           SET data = EXCLUDED.data,
               updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(Json(document))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Batched multi-row insert; returns the number of rows written.
async fn upsert_rows(
    conn: &mut PgConnection,
    rows: &[SponsorRow],
    chunk_size: usize,
    on_conflict: OnConflict,
) -> Result<u64, StoreError> {
    let mut written = 0;
    for chunk in upsert_chunks(rows, chunk_size) {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_SPONSORS);
        query.push_values(chunk, |mut b, row| {
            b.push_bind(row.id.as_str())
                .push_bind(row.sponsor_year)
                .push_bind(row.name.as_deref())
                .push_bind(row.company.as_deref())
                .push_bind(row.contact.as_deref())
                .push_bind(row.phone.as_deref())
                .push_bind(row.sponsorship_type.as_deref())
                .push_bind(row.event_type.as_deref())
                .push_bind(row.amount)
                .push_bind(row.status.as_deref())
                .push_bind(row.is_contract_signed)
                .push_bind(row.is_logo_received)
                .push_bind(row.is_banner_placed)
                .push_bind(row.is_payment_received)
                .push_bind(row.notes.as_deref())
                .push_bind(row.date);
        });
        query.push(match on_conflict {
            OnConflict::Update => ON_CONFLICT_UPDATE,
            OnConflict::Ignore => " ON CONFLICT (id) DO NOTHING",
        });
        written += query.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

#[async_trait]
impl StateStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.migrate().await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO app_state (id, data, updated_at) VALUES (1, $1, NOW()) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(Json(AppStateDocument::empty()))
        .execute(&mut *tx)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sponsors")
            .fetch_one(&mut *tx)
            .await?;
        if count == 0 {
            let document = read_document(&mut tx, true).await?;
            let rows = seed_rows(&document);
            if !rows.is_empty() {
                upsert_rows(&mut tx, &rows, self.chunk_size, OnConflict::Ignore).await?;
                info!(seeded = rows.len(), "seeded sponsors table from document");
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_state(&self) -> Result<AppStateDocument, StoreError> {
        let mut conn = self.pool.acquire().await?;
        read_document(&mut conn, false).await
    }

    async fn apply_state(&self, incoming: &AppStateDocument) -> Result<ApplySummary, StoreError> {
        let rows = incoming.sponsors.as_deref().map(rows_for_apply).transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT 1 FROM app_state WHERE id = 1 FOR UPDATE")
            .execute(&mut *tx)
            .await?;
        write_document(&mut tx, incoming).await?;

        let mut summary = ApplySummary::default();
        if let Some(rows) = rows {
            upsert_rows(&mut tx, &rows, self.chunk_size, OnConflict::Update).await?;
            summary.upserts = rows.len();

            let ids: Vec<String> = rows.into_iter().map(|row| row.id).collect();
            let deleted = if ids.is_empty() {
                sqlx::query("DELETE FROM sponsors").execute(&mut *tx).await?
            } else {
                sqlx::query("DELETE FROM sponsors WHERE NOT (id = ANY($1))")
                    .bind(ids.as_slice())
                    .execute(&mut *tx)
                    .await?
            };
            summary.deletes = deleted.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn sponsor_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM sponsors")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn list_sponsors(&self) -> Result<Vec<Sponsor>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(rows_into_sponsors(fetch_rows(&mut conn).await?))
    }

    async fn get_sponsor(&self, id: &str) -> Result<Option<Sponsor>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_row(&mut conn, id, false)
            .await?
            .map(SponsorRow::into_sponsor))
    }

    async fn create_sponsor(&self, mut sponsor: Sponsor) -> Result<Sponsor, StoreError> {
        sponsor.prepare_for_storage(Utc::now())?;
        let row = SponsorRow::from_sponsor(&sponsor)?;

        let mut tx = self.pool.begin().await?;
        let document = read_document(&mut tx, true).await?;
        let inserted = upsert_rows(
            &mut tx,
            std::slice::from_ref(&row),
            1,
            OnConflict::Ignore,
        )
        .await?;
        if inserted == 0 {
            return Err(StoreError::SponsorExists(row.id));
        }
        Self::commit_with_resync(tx, document, Some(&sponsor)).await?;
        Ok(sponsor)
    }

    async fn update_sponsor(&self, id: &str, patch: SponsorPatch) -> Result<Sponsor, StoreError> {
        let mut tx = self.pool.begin().await?;
        let document = read_document(&mut tx, true).await?;
        let row = fetch_row(&mut tx, id, true)
            .await?
            .ok_or_else(|| StoreError::SponsorNotFound(id.to_string()))?;

        let mut sponsor = row.into_sponsor();
        patch.apply_to(&mut sponsor)?;
        let updated = SponsorRow::from_sponsor(&sponsor)?;
        upsert_rows(
            &mut tx,
            std::slice::from_ref(&updated),
            1,
            OnConflict::Update,
        )
        .await?;

        Self::commit_with_resync(tx, document, Some(&sponsor)).await?;
        Ok(sponsor)
    }

    async fn delete_sponsor(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let document = read_document(&mut tx, true).await?;
        let deleted = sqlx::query("DELETE FROM sponsors WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::SponsorNotFound(id.to_string()));
        }
        Self::commit_with_resync(tx, document, None).await
    }
}
