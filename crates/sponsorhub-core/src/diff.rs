//! Set-difference over sponsor identifiers: what an apply would upsert and
//! what it would delete.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AppStateDocument, Sponsor};

/// Preview payloads carry at most this many ids per side.
pub const SAMPLE_LIMIT: usize = 10;
/// Sample entry standing in for an incoming sponsor that has no id yet.
pub const NEW_SPONSOR_PLACEHOLDER: &str = "(new)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub upsert_count: usize,
    pub delete_count: usize,
    pub sample_upsert_ids: Vec<String>,
    pub sample_delete_ids: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.upsert_count == 0 && self.delete_count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApplySummary {
    pub upserts: usize,
    pub deletes: usize,
}

/// Additions and removals only: an incoming sponsor whose id already exists
/// is not reported, whatever its field values.
pub fn diff(existing_ids: &BTreeSet<String>, incoming: &[Sponsor]) -> DiffResult {
    let mut result = DiffResult::default();

    for sponsor in incoming {
        let known = sponsor
            .id
            .as_ref()
            .is_some_and(|id| existing_ids.contains(id));
        if !known {
            result.upsert_count += 1;
            if result.sample_upsert_ids.len() < SAMPLE_LIMIT {
                result
                    .sample_upsert_ids
                    .push(sponsor.id_or_placeholder().to_string());
            }
        }
    }

    let incoming_ids: BTreeSet<&str> = incoming.iter().filter_map(|s| s.id.as_deref()).collect();
    for id in existing_ids {
        if !incoming_ids.contains(id.as_str()) {
            result.delete_count += 1;
            if result.sample_delete_ids.len() < SAMPLE_LIMIT {
                result.sample_delete_ids.push(id.clone());
            }
        }
    }

    result
}

/// A document without a sponsor list leaves the table alone.
pub fn diff_state(existing_ids: &BTreeSet<String>, incoming: &AppStateDocument) -> DiffResult {
    match incoming.sponsors.as_deref() {
        Some(sponsors) => diff(existing_ids, sponsors),
        None => DiffResult::default(),
    }
}

/// Splits rows into bounded upsert batches. A zero size means one row per batch.
pub fn upsert_chunks<T>(rows: &[T], chunk_size: usize) -> std::slice::Chunks<'_, T> {
    rows.chunks(chunk_size.max(1))
}

/// Disagreement between the document's embedded sponsors and the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub only_in_document: Vec<String>,
    pub only_in_table: Vec<String>,
    pub in_sync: bool,
}

pub fn drift(document: &AppStateDocument, table_ids: &BTreeSet<String>) -> DriftReport {
    let document_ids = document.sponsor_ids();
    let only_in_document: Vec<String> = document_ids.difference(table_ids).cloned().collect();
    let only_in_table: Vec<String> = table_ids.difference(&document_ids).cloned().collect();
    DriftReport {
        in_sync: only_in_document.is_empty() && only_in_table.is_empty(),
        only_in_document,
        only_in_table,
    }
}
