use std::path::PathBuf;
use std::str::FromStr;

use crate::StoreError;

pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `store.json` under the data directory.
    File,
    Postgres,
    /// PostgREST-compatible HTTP API (Supabase).
    Remote,
    Disabled,
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "file" => Ok(Self::File),
            "postgres" | "pg" => Ok(Self::Postgres),
            "remote" | "supabase" => Ok(Self::Remote),
            "none" | "disabled" => Ok(Self::Disabled),
            other => Err(StoreError::Config(format!(
                "unknown STORAGE_BACKEND {other:?} (expected file, postgres, remote or none)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub upsert_chunk_size: usize,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let backend = match non_empty("STORAGE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::File,
        };
        let upsert_chunk_size = match non_empty("UPSERT_CHUNK_SIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| StoreError::Config(format!("invalid UPSERT_CHUNK_SIZE {raw:?}")))?,
            None => DEFAULT_UPSERT_CHUNK_SIZE,
        };
        Ok(Self {
            backend,
            data_dir: non_empty("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            database_url: non_empty("DATABASE_URL"),
            supabase_url: non_empty("SUPABASE_URL"),
            supabase_key: non_empty("SUPABASE_KEY"),
            upsert_chunk_size,
        })
    }

    pub fn file_backed(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::File,
            data_dir: data_dir.into(),
            database_url: None,
            supabase_url: None,
            supabase_key: None,
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
