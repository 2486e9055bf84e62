//! Local-disk housekeeping for SponsorHub (backup snapshots and the applied
//! changes log) plus the retrying HTTP client used by the import tool.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sponsorhub_core::ApplySummary;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod http;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, ImportSummary, SponsorImporter};

pub const CRATE_NAME: &str = "sponsorhub-storage";

pub const BACKUP_PREFIX: &str = "app_state-backup-";
pub const BACKUP_EXTENSION: &str = "json";
pub const AUDIT_LOG_FILE: &str = "applied-changes.log";

#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub file_name: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup file name {0:?}")]
    InvalidName(String),
    #[error("backup {0} not found")]
    NotFound(String),
    #[error("reading backup {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Replaces `path` with `bytes` through a sibling temp file and a rename, so
/// readers see either the old content or the new, never a partial write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Directory of immutable, timestamped copies of the canonical document.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `app_state-backup-2026-03-01T09-30-00-000Z.json`: the ISO timestamp
    /// with `:` and `.` swapped for `-`.
    pub fn backup_file_name(at: DateTime<Utc>, attempt: usize) -> String {
        let stamp = at.format("%Y-%m-%dT%H-%M-%S-%3fZ");
        if attempt == 0 {
            format!("{BACKUP_PREFIX}{stamp}.{BACKUP_EXTENSION}")
        } else {
            format!("{BACKUP_PREFIX}{stamp}-{attempt}.{BACKUP_EXTENSION}")
        }
    }

    /// Bare file names only: no separators, no parent references, no dotfiles.
    pub fn validate_name(name: &str) -> Result<(), BackupError> {
        let well_formed = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..")
            && name.ends_with(&format!(".{BACKUP_EXTENSION}"));
        if well_formed {
            Ok(())
        } else {
            Err(BackupError::InvalidName(name.to_string()))
        }
    }

    /// Writes a pretty-printed snapshot under a fresh name via temp file and
    /// atomic rename. An existing backup is never overwritten.
    pub async fn write_snapshot<T: Serialize>(
        &self,
        at: DateTime<Utc>,
        value: &T,
    ) -> anyhow::Result<StoredBackup> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing backup snapshot")?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating backup directory {}", self.root.display()))?;

        let (file_name, path) = self.reserve_name(at).await?;
        if let Err(err) = write_atomic(&path, &bytes).await {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }

        Ok(StoredBackup {
            file_name,
            byte_size: bytes.len(),
        })
    }

    async fn reserve_name(&self, at: DateTime<Utc>) -> anyhow::Result<(String, PathBuf)> {
        let mut attempt = 0;
        loop {
            let name = Self::backup_file_name(at, attempt);
            let path = self.root.join(&name);
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok((name, path)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reserving backup name {}", path.display()))
                }
            }
        }
    }

    /// Timestamp part and collision counter of a backup name, so `…Z-2`
    /// sorts after `…Z-1` and both after `…Z`.
    fn name_order(name: &str) -> (&str, usize) {
        let stem = name
            .strip_suffix(&format!(".{BACKUP_EXTENSION}"))
            .unwrap_or(name);
        match stem.rsplit_once("Z-") {
            Some((stamp, n)) => match n.parse() {
                Ok(n) => (stamp, n),
                Err(_) => (stem, 0),
            },
            None => (stem.strip_suffix('Z').unwrap_or(stem), 0),
        }
    }

    /// Backup file names, newest first. A missing directory lists as empty;
    /// empty files are names reserved by a write still in flight.
    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading backup directory {}", self.root.display()))
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::validate_name(&name).is_err() {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }
            entries.push((metadata.modified().ok(), name));
        }
        entries.sort_by(|(a_time, a), (b_time, b)| {
            b_time
                .cmp(a_time)
                .then_with(|| Self::name_order(b).cmp(&Self::name_order(a)))
        });
        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, BackupError> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, BackupError> {
        let path = self.path_for(name)?;
        fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                BackupError::NotFound(name.to_string())
            } else {
                BackupError::Io {
                    name: name.to_string(),
                    source,
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Apply,
    Restore,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apply => "APPLY",
            Self::Restore => "RESTORE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub target: String,
    pub summary: ApplySummary,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, target: impl Into<String>, summary: ApplySummary) -> Self {
        Self {
            at: Utc::now(),
            kind,
            target: target.into(),
            summary,
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: upserts={} deletes={}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind,
            self.target,
            self.summary.upserts,
            self.summary.deletes
        )
    }
}

/// Append-only, line-oriented record of applied saves and restores.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(AUDIT_LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(format!("{entry}\n").as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// The most recent `limit` lines, newest first.
    pub async fn tail(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .rev()
            .take(limit)
            .map(ToString::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn backup_names_follow_iso_stamp() {
        assert_eq!(
            BackupStore::backup_file_name(at(), 0),
            "app_state-backup-2026-03-01T09-30-00-000Z.json"
        );
        assert_eq!(
            BackupStore::backup_file_name(at(), 2),
            "app_state-backup-2026-03-01T09-30-00-000Z-2.json"
        );
    }

    #[test]
    fn traversal_names_are_rejected() {
        for bad in ["", "../secret.json", "a/b.json", "..json", ".hidden.json", "notes.txt", "a\\b.json"] {
            assert!(BackupStore::validate_name(bad).is_err(), "{bad} should be rejected");
        }
        assert!(BackupStore::validate_name("app_state-backup-x.json").is_ok());
    }

    #[tokio::test]
    async fn snapshots_with_same_timestamp_get_distinct_names() {
        let dir = tempdir().expect("tempdir");
        let store = BackupStore::new(dir.path().join("backups"));

        let first = store.write_snapshot(at(), &json!({"n": 1})).await.expect("first");
        let second = store.write_snapshot(at(), &json!({"n": 2})).await.expect("second");
        assert_ne!(first.file_name, second.file_name);

        let listed = store.list().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first.file_name));

        let body: serde_json::Value =
            serde_json::from_slice(&store.read(&first.file_name).await.expect("read")).unwrap();
        assert_eq!(body["n"], 1);
    }

    #[tokio::test]
    async fn same_mtime_backups_list_by_collision_counter() {
        let dir = tempdir().expect("tempdir");
        let store = BackupStore::new(dir.path());
        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_772_000_000);
        for attempt in [0, 2, 1, 10] {
            let path = dir.path().join(BackupStore::backup_file_name(at(), attempt));
            std::fs::write(&path, b"{}").unwrap();
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }

        let listed = store.list().await.expect("list");
        let expected: Vec<String> = [10, 2, 1, 0]
            .into_iter()
            .map(|attempt| BackupStore::backup_file_name(at(), attempt))
            .collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn reserved_but_unwritten_names_are_not_listed() {
        let dir = tempdir().expect("tempdir");
        let store = BackupStore::new(dir.path());
        let written = store.write_snapshot(at(), &json!({"n": 1})).await.expect("write");
        let (reserved, _) = store.reserve_name(at()).await.expect("reserve");
        assert_ne!(reserved, written.file_name);

        assert_eq!(store.list().await.expect("list"), vec![written.file_name]);
    }

    #[tokio::test]
    async fn missing_backup_and_missing_dir_are_distinguished() {
        let dir = tempdir().expect("tempdir");
        let store = BackupStore::new(dir.path().join("nope"));
        assert!(store.list().await.expect("list").is_empty());
        assert!(matches!(
            store.read("app_state-backup-none.json").await,
            Err(BackupError::NotFound(_))
        ));
        assert!(matches!(
            store.read("../store.json").await,
            Err(BackupError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn audit_log_tails_newest_first() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::in_dir(dir.path().join("logs"));
        assert!(log.tail(200).await.expect("empty tail").is_empty());

        for upserts in 0..3 {
            let entry = AuditEntry {
                at: at(),
                kind: AuditKind::Apply,
                target: "state".into(),
                summary: ApplySummary { upserts, deletes: 1 },
            };
            log.append(&entry).await.expect("append");
        }
        log.append(&AuditEntry {
            at: at(),
            kind: AuditKind::Restore,
            target: "app_state-backup-a.json".into(),
            summary: ApplySummary::default(),
        })
        .await
        .expect("append restore");

        let lines = log.tail(2).await.expect("tail");
        assert_eq!(
            lines,
            vec![
                "2026-03-01T09:30:00.000Z RESTORE app_state-backup-a.json: upserts=0 deletes=0",
                "2026-03-01T09:30:00.000Z APPLY state: upserts=2 deletes=1",
            ]
        );
    }
}
