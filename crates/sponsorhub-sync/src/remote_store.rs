//! PostgREST backend (Supabase). The document lives in `app_state` under a
//! fixed row id with a `state` column.
//!
//! PostgREST offers no multi-request transaction: the steps of an apply run
//! in order and stop at the first failure, leaving earlier steps in place.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sponsorhub_core::{upsert_chunks, AppStateDocument, ApplySummary, Sponsor, SponsorPatch};
use sponsorhub_storage::HttpClientConfig;
use tracing::debug;

use crate::{
    resync_embedded, rows_for_apply, rows_into_sponsors, seed_rows, SponsorRow, StateStore,
    StoreError,
};

pub const STATE_ROW_ID: &str = "singleton";
const SPONSOR_ORDER: &str = "company.asc.nullslast,name.asc.nullslast,id.asc";

#[derive(Debug, Serialize)]
struct StateRowOut<'a> {
    id: &'a str,
    state: &'a AppStateDocument,
}

#[derive(Debug, Deserialize)]
struct StateRowIn {
    #[serde(default)]
    state: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

/// `id=not.in.("a","b")` filter value; quotes keep commas and parentheses
/// inside ids from breaking the list.
pub fn not_in_filter(ids: &[String]) -> String {
    if ids.is_empty() {
        return "not.is.null".to_string();
    }
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("not.in.({})", quoted.join(","))
}

#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chunk_size: usize,
}

impl RemoteStore {
    pub fn new(base_url: &str, api_key: &str, chunk_size: usize) -> Result<Self, StoreError> {
        let client = HttpClientConfig::default().build_client()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            chunk_size,
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(request: RequestBuilder) -> Result<Response, StoreError> {
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Remote {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }

    async fn put_state(&self, document: &AppStateDocument) -> Result<(), StoreError> {
        let request = self
            .request(Method::POST, "app_state")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[StateRowOut {
                id: STATE_ROW_ID,
                state: document,
            }]);
        Self::send(request).await?;
        Ok(())
    }

    async fn fetch_rows(&self, id: Option<&str>) -> Result<Vec<SponsorRow>, StoreError> {
        let mut request = self
            .request(Method::GET, "sponsors")
            .query(&[("select", "*"), ("order", SPONSOR_ORDER)]);
        if let Some(id) = id {
            request = request.query(&[("id", format!("eq.{id}"))]);
        }
        Ok(Self::send(request).await?.json().await?)
    }

    async fn upsert_rows(&self, rows: &[SponsorRow], merge: bool) -> Result<(), StoreError> {
        let prefer = if merge {
            "resolution=merge-duplicates,return=minimal"
        } else {
            "resolution=ignore-duplicates,return=minimal"
        };
        for chunk in upsert_chunks(rows, self.chunk_size) {
            let request = self
                .request(Method::POST, "sponsors")
                .query(&[("on_conflict", "id")])
                .header("Prefer", prefer)
                .json(chunk);
            Self::send(request).await?;
            debug!(rows = chunk.len(), "upserted sponsor chunk");
        }
        Ok(())
    }

    /// Deletes matching rows and returns how many went.
    async fn delete_where(&self, id_filter: String) -> Result<usize, StoreError> {
        let request = self
            .request(Method::DELETE, "sponsors")
            .query(&[("id", id_filter.as_str()), ("select", "id")])
            .header("Prefer", "return=representation");
        let deleted: Vec<IdOnly> = Self::send(request).await?.json().await?;
        Ok(deleted.len())
    }

    async fn resync_document(&self, changed: Option<&Sponsor>) -> Result<(), StoreError> {
        let mut document = self.get_state().await?;
        resync_embedded(&mut document, self.fetch_rows(None).await?, changed);
        self.put_state(&document).await
    }
}

#[async_trait]
impl StateStore for RemoteStore {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    /// Tables are provisioned out of band; this creates the singleton row
    /// and seeds an empty sponsors table.
    async fn init(&self) -> Result<(), StoreError> {
        let request = self
            .request(Method::GET, "app_state")
            .query(&[("id", format!("eq.{STATE_ROW_ID}"))])
            .query(&[("select", "id")]);
        let existing: Vec<IdOnly> = Self::send(request).await?.json().await?;
        if existing.is_empty() {
            self.put_state(&AppStateDocument::empty()).await?;
        }

        if self.sponsor_ids().await?.is_empty() {
            let rows = seed_rows(&self.get_state().await?);
            self.upsert_rows(&rows, false).await?;
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<AppStateDocument, StoreError> {
        let request = self
            .request(Method::GET, "app_state")
            .query(&[("id", format!("eq.{STATE_ROW_ID}"))])
            .query(&[("select", "state")]);
        let rows: Vec<StateRowIn> = Self::send(request).await?.json().await?;
        match rows.into_iter().next().and_then(|row| row.state) {
            Some(state) => Ok(serde_json::from_value(state)?),
            None => Ok(AppStateDocument::empty()),
        }
    }

    async fn apply_state(&self, incoming: &AppStateDocument) -> Result<ApplySummary, StoreError> {
        let rows = incoming.sponsors.as_deref().map(rows_for_apply).transpose()?;

        self.put_state(incoming).await?;
        let mut summary = ApplySummary::default();
        if let Some(rows) = rows {
            self.upsert_rows(&rows, true).await?;
            summary.upserts = rows.len();
            let ids: Vec<String> = rows.into_iter().map(|row| row.id).collect();
            summary.deletes = self.delete_where(not_in_filter(&ids)).await?;
        }
        Ok(summary)
    }

    async fn sponsor_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let request = self
            .request(Method::GET, "sponsors")
            .query(&[("select", "id")]);
        let ids: Vec<IdOnly> = Self::send(request).await?.json().await?;
        Ok(ids.into_iter().map(|row| row.id).collect())
    }

    async fn list_sponsors(&self) -> Result<Vec<Sponsor>, StoreError> {
        Ok(rows_into_sponsors(self.fetch_rows(None).await?))
    }

    async fn get_sponsor(&self, id: &str) -> Result<Option<Sponsor>, StoreError> {
        Ok(self
            .fetch_rows(Some(id))
            .await?
            .into_iter()
            .next()
            .map(SponsorRow::into_sponsor))
    }

    async fn create_sponsor(&self, mut sponsor: Sponsor) -> Result<Sponsor, StoreError> {
        sponsor.prepare_for_storage(Utc::now())?;
        let row = SponsorRow::from_sponsor(&sponsor)?;

        let resp = self
            .request(Method::POST, "sponsors")
            .header("Prefer", "return=minimal")
            .json(&[&row])
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StoreError::SponsorExists(row.id));
        }
        if !resp.status().is_success() {
            return Err(StoreError::Remote {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        self.resync_document(Some(&sponsor)).await?;
        Ok(sponsor)
    }

    async fn update_sponsor(&self, id: &str, patch: SponsorPatch) -> Result<Sponsor, StoreError> {
        let mut sponsor = self
            .get_sponsor(id)
            .await?
            .ok_or_else(|| StoreError::SponsorNotFound(id.to_string()))?;
        patch.apply_to(&mut sponsor)?;
        let row = SponsorRow::from_sponsor(&sponsor)?;

        let request = self
            .request(Method::PATCH, "sponsors")
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&row);
        Self::send(request).await?;

        self.resync_document(Some(&sponsor)).await?;
        Ok(sponsor)
    }

    async fn delete_sponsor(&self, id: &str) -> Result<(), StoreError> {
        if self.delete_where(format!("eq.{id}")).await? == 0 {
            return Err(StoreError::SponsorNotFound(id.to_string()));
        }
        self.resync_document(None).await
    }
}
