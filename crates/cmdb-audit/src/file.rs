//! File-system backed audit store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::{AuditError, AuditSink, ChainHead};
use crate::{AuditId, AuditLogEntry};

/// Stores entries as JSON files in a directory tree:
/// ```text
/// {root}/
///   2024/
///     01/
///       15/
///         {entry_id}.json
/// ```
///
/// Blocking file I/O runs on the blocking thread pool. Appends are
/// serialized by the chain head lock.
#[derive(Clone)]
pub struct FileAuditStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    head: Mutex<ChainHead>,
}

impl FileAuditStore {
    /// Open a store rooted at the given directory, creating it if needed.
    /// The chain head is recovered from the entries already on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut existing = Vec::new();
        collect_entries_recursive(&root, &mut existing)?;
        let head = ChainHead::from_entries(&existing);

        tracing::info!(
            root = %root.display(),
            entries = existing.len(),
            sequence = head.sequence,
            "Opened audit store"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                head: Mutex::new(head),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AuditError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, AuditError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| AuditError::Internal(format!("audit I/O task failed: {e}")))?
    }
}

impl Inner {
    /// Build the file path for an entry based on its timestamp and ID.
    fn entry_path(&self, entry: &AuditLogEntry) -> PathBuf {
        let date = entry.timestamp.format("%Y/%m/%d");
        self.root.join(format!("{}/{}.json", date, entry.id.0))
    }

    fn find_path(&self, id: AuditId) -> Result<PathBuf, AuditError> {
        let filename = format!("{}.json", id.0);
        find_file_recursive(&self.root, &filename).ok_or(AuditError::NotFound(id))
    }

    fn append(&self, entry: AuditLogEntry) -> Result<AuditLogEntry, AuditError> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| AuditError::Internal("audit chain lock poisoned".into()))?;

        let sealed = entry.seal(&head);
        let path = self.entry_path(&sealed);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(&sealed)?)?;

        *head = ChainHead::after(&sealed);
        tracing::debug!(
            audit_id = %sealed.id,
            sequence = sealed.sequence,
            path = %path.display(),
            "Audit entry saved"
        );
        Ok(sealed)
    }

    fn get(&self, id: AuditId) -> Result<AuditLogEntry, AuditError> {
        let path = self.find_path(id)?;
        let entry: AuditLogEntry = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if !entry.verify_integrity() {
            return Err(AuditError::IntegrityViolation(id));
        }
        Ok(entry)
    }

    fn entries(&self) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut results = Vec::new();
        collect_entries_recursive(&self.root, &mut results)?;
        results.sort_by_key(|e| e.sequence);
        Ok(results)
    }

    fn delete(&self, id: AuditId) -> Result<(), AuditError> {
        let path = self.find_path(id)?;
        fs::remove_file(&path)?;
        tracing::info!(audit_id = %id, "Audit entry purged");
        Ok(())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError> {
        let mut removed = 0;
        for entry in self.entries()? {
            if entry.timestamp < cutoff {
                fs::remove_file(self.entry_path(&entry))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl AuditSink for FileAuditStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<AuditLogEntry, AuditError> {
        self.blocking(move |inner| inner.append(entry)).await
    }

    async fn get(&self, id: AuditId) -> Result<AuditLogEntry, AuditError> {
        self.blocking(move |inner| inner.get(id)).await
    }

    async fn entries(&self) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.blocking(|inner| inner.entries()).await
    }

    async fn delete(&self, id: AuditId) -> Result<(), AuditError> {
        self.blocking(move |inner| inner.delete(id)).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AuditError> {
        self.blocking(move |inner| inner.delete_older_than(cutoff)).await
    }
}

/// Recursively find a file by name.
fn find_file_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }

    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_recursive(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }

    None
}

/// Recursively collect every stored entry.
fn collect_entries_recursive(dir: &Path, results: &mut Vec<AuditLogEntry>) -> Result<(), AuditError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_entries_recursive(&path, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let json = fs::read_to_string(&path)?;
            results.push(serde_json::from_str(&json)?);
        }
    }

    Ok(())
}
