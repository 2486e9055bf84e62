//! Core domain model for SponsorHub: sponsors, the canonical application
//! state document, and the diff engine that reconciles the two.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub mod diff;
mod lenient;

pub use diff::{diff, diff_state, drift, upsert_chunks, ApplySummary, DiffResult, DriftReport};

pub const CRATE_NAME: &str = "sponsorhub-core";

pub const ID_PREFIX: &str = "id-";
const ID_SUFFIX_LEN: usize = 7;
const ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("sponsor {id}: amount must be a finite, non-negative number")]
    InvalidAmount { id: String },
    #[error("duplicate sponsor id {0}")]
    DuplicateId(String),
    #[error("sponsor id is immutable (stored {stored}, received {received})")]
    ImmutableId { stored: String, received: String },
}

/// Fresh identifier in the `id-xxxxxxx` shape the browser client also produces.
pub fn generate_sponsor_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(ID_PREFIX.len() + ID_SUFFIX_LEN);
    out.push_str(ID_PREFIX);
    for _ in 0..ID_SUFFIX_LEN {
        out.push(ID_ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

/// One sponsorship record, as embedded in the canonical document and as a
/// row of the normalized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sponsor {
    #[serde(
        default,
        deserialize_with = "lenient::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_year")]
    pub sponsor_year: Option<i32>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub contact: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub phone: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient::opt_text")]
    pub sponsorship_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub amount: f64,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_contract_signed: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_logo_received: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_banner_placed: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_payment_received: bool,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub date: Option<DateTime<Utc>>,
    /// Client-side fields the normalized table does not model (e.g. `dateAdded`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Sponsor {
    pub fn id_or_placeholder(&self) -> &str {
        self.id.as_deref().unwrap_or(diff::NEW_SPONSOR_PLACEHOLDER)
    }

    /// Assigns an identifier when missing and returns the one in effect.
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(generate_sponsor_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(ValidationError::InvalidAmount {
                id: self.id_or_placeholder().to_string(),
            });
        }
        Ok(())
    }

    /// Fills the defaults a persisted row always carries: an id and a timestamp.
    pub fn prepare_for_storage(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.validate()?;
        self.ensure_id();
        if self.date.is_none() {
            self.date = Some(now);
        }
        Ok(())
    }

    /// Table rows carry no client-only fields.
    pub fn without_extra(mut self) -> Self {
        self.extra.clear();
        self
    }
}

/// Listing order of the normalized table: company, then name, nulls last.
pub fn listing_order(a: &Sponsor, b: &Sponsor) -> Ordering {
    fn nulls_last(a: &Option<String>, b: &Option<String>) -> Ordering {
        match (a, b) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
    nulls_last(&a.company, &b.company).then_with(|| nulls_last(&a.name, &b.name))
}

/// Partial update for a single sponsor. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SponsorPatch {
    #[serde(default, deserialize_with = "lenient::opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_year")]
    pub sponsor_year: Option<i32>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub contact: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub phone: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient::opt_text")]
    pub sponsorship_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_amount")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_flag")]
    pub is_contract_signed: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_flag")]
    pub is_logo_received: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_flag")]
    pub is_banner_placed: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_flag")]
    pub is_payment_received: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub date: Option<DateTime<Utc>>,
}

impl SponsorPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(self, target: &mut Sponsor) -> Result<(), ValidationError> {
        if let (Some(received), Some(stored)) = (&self.id, &target.id) {
            if received != stored {
                return Err(ValidationError::ImmutableId {
                    stored: stored.clone(),
                    received: received.clone(),
                });
            }
        }

        let mut next = target.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { next.$field = Some(value); })*
            };
        }
        merge!(
            sponsor_year,
            name,
            company,
            contact,
            phone,
            sponsorship_type,
            event_type,
            status,
            notes,
            date
        );
        if let Some(amount) = self.amount {
            next.amount = amount;
        }
        if let Some(v) = self.is_contract_signed {
            next.is_contract_signed = v;
        }
        if let Some(v) = self.is_logo_received {
            next.is_logo_received = v;
        }
        if let Some(v) = self.is_banner_placed {
            next.is_banner_placed = v;
        }
        if let Some(v) = self.is_payment_received {
            next.is_payment_received = v;
        }

        next.validate()?;
        *target = next;
        Ok(())
    }
}

/// The canonical, singleton application state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStateDocument {
    /// `None` means the document carries no sponsor list at all, which is
    /// different from an empty list when reconciling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsors: Option<Vec<Sponsor>>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub events: Vec<Value>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub tasks: Vec<Value>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub notes: Vec<Value>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub assets: Vec<Value>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub profile: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppStateDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl AppStateDocument {
    /// First-boot document: every collection present and empty.
    pub fn empty() -> Self {
        Self {
            sponsors: Some(Vec::new()),
            events: Vec::new(),
            tasks: Vec::new(),
            notes: Vec::new(),
            assets: Vec::new(),
            profile: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn sponsor_ids(&self) -> BTreeSet<String> {
        self.sponsors
            .iter()
            .flatten()
            .filter_map(|s| s.id.clone())
            .collect()
    }

    /// Assigns missing ids, stamps missing dates and validates every sponsor.
    /// Runs before any write so the document and the table agree on ids.
    pub fn prepare_for_apply(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let Some(sponsors) = self.sponsors.as_mut() else {
            return Ok(());
        };
        let mut seen = BTreeSet::new();
        for sponsor in sponsors.iter_mut() {
            sponsor.prepare_for_storage(now)?;
            let id = sponsor.ensure_id().to_string();
            if !seen.insert(id.clone()) {
                return Err(ValidationError::DuplicateId(id));
            }
        }
        Ok(())
    }

    /// Replaces the embedded sponsor list with the normalized table's rows.
    pub fn replace_sponsors(&mut self, mut rows: Vec<Sponsor>) {
        rows.sort_by(listing_order);
        self.sponsors = Some(rows);
    }

    /// Rebuilds the embedded list from table rows. Fields the table does not
    /// store are carried over from the embedded sponsor with the same id
    /// unless the row brings its own.
    pub fn resync_sponsors(&mut self, rows: Vec<Sponsor>) {
        let mut extras: BTreeMap<String, Map<String, Value>> = self
            .sponsors
            .take()
            .into_iter()
            .flatten()
            .filter_map(|s| Some((s.id?, s.extra)))
            .collect();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                if row.extra.is_empty() {
                    if let Some(extra) = row.id.as_ref().and_then(|id| extras.remove(id)) {
                        row.extra = extra;
                    }
                }
                row
            })
            .collect();
        self.replace_sponsors(rows);
    }

    pub fn set_profile_field(&mut self, key: &str, value: Value) -> Option<Value> {
        self.profile.insert(key.to_string(), value)
    }
}
